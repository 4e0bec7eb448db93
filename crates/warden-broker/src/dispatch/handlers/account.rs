//! Account handlers: create, derive, background sync.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::dispatch::params::require_str;
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::types::Reply;

/// Create an account from a secret.
pub struct CreateAccountHandler;

#[async_trait]
impl Handler for CreateAccountHandler {
    #[instrument(skip_all, fields(message_type = "account.create"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let secret = require_str(&payload, "secret")?;
        let name = payload.get("name").and_then(Value::as_str).unwrap_or("");
        let account = ctx
            .session
            .services
            .keyring
            .create_account(secret, name)
            .await?;
        let _ = ctx.session.lock.lock_if_always(false).await?;
        Ok(Reply::Value(account))
    }
}

/// Derive a child account.
pub struct DeriveAccountHandler;

#[async_trait]
impl Handler for DeriveAccountHandler {
    #[instrument(skip_all, fields(message_type = "account.derive"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let parent = require_str(&payload, "parentAddress")?;
        let path = require_str(&payload, "path")?;
        let account = ctx
            .session
            .services
            .keyring
            .derive_account(parent, path)
            .await?;
        let _ = ctx.session.lock.lock_if_always(false).await?;
        Ok(Reply::Value(account))
    }
}

/// Start a full account sync in the background.
///
/// Auto-lock is suppressed until the sync finishes.
pub struct SyncAccountHandler;

#[async_trait]
impl Handler for SyncAccountHandler {
    #[instrument(skip_all, fields(message_type = "account.sync"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let address = require_str(&payload, "address")?.to_owned();
        let guard = ctx.session.lock.skip_auto_lock();
        let chains = ctx.session.services.chains.clone();

        ctx.session.spawn_job("account-sync", async move {
            let _guard = guard;
            match chains.sync_account(&address).await {
                Ok(_) => info!(%address, "account sync finished"),
                Err(err) => warn!(%address, error = %err, "account sync failed"),
            }
        });
        Ok(Reply::Value(json!({ "started": true })))
    }
}
