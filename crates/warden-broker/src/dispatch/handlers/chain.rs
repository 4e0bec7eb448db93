//! Chain and transaction handlers.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument};

use crate::dispatch::params::{require, require_str};
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::types::Reply;

/// Info for one chain.
pub struct ChainInfoHandler;

#[async_trait]
impl Handler for ChainInfoHandler {
    #[instrument(skip_all, fields(message_type = "chain.getInfo"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let chain = require_str(&payload, "chain")?;
        let info = ctx.session.services.chains.chain_info(chain).await?;
        Ok(Reply::Value(info))
    }
}

/// Current chain state plus every later state.
pub struct SubscribeChainStateHandler;

#[async_trait]
impl Handler for SubscribeChainStateHandler {
    #[instrument(skip_all, fields(message_type = "chain.subscribeState"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let chain = require_str(&payload, "chain")?;
        let feed = ctx.session.services.chains.subscribe_chain_state(chain).await?;
        let subscription_id = ctx.session.subscriptions.subscribe_stream(
            &ctx.channel,
            &ctx.request_id,
            feed.updates,
            ctx.ready.clone(),
        );
        Ok(Reply::Subscribed {
            subscription_id,
            current: feed.current,
        })
    }
}

/// Build and submit a transaction.
pub struct SubmitTransactionHandler;

#[async_trait]
impl Handler for SubmitTransactionHandler {
    #[instrument(skip_all, fields(message_type = "transaction.submit"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let spec = require(&payload, "transaction")?.clone();
        let result = ctx
            .session
            .services
            .transactions
            .build_and_submit(spec)
            .await?;
        info!("transaction submitted");
        Ok(Reply::Value(result))
    }
}
