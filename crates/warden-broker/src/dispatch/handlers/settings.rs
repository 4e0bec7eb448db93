//! Settings handlers: get, subscribe, save auto-lock time.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

use crate::dispatch::handlers::{subscribe_watch, to_value};
use crate::dispatch::params::parse;
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::types::Reply;

/// Current settings.
pub struct GetSettingsHandler;

#[async_trait]
impl Handler for GetSettingsHandler {
    #[instrument(skip_all, fields(message_type = "settings.get"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        Ok(Reply::Value(to_value(&ctx.session.services.settings.get())?))
    }
}

/// Current settings plus every later change.
pub struct SubscribeSettingsHandler;

#[async_trait]
impl Handler for SubscribeSettingsHandler {
    #[instrument(skip_all, fields(message_type = "settings.subscribe"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let rx = ctx.session.services.settings.subscribe();
        Ok(subscribe_watch(ctx, rx, |settings| {
            serde_json::to_value(settings).unwrap_or(Value::Null)
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SaveAutoLockParams {
    auto_lock_time: u32,
}

/// Persist the idle-lock timeout and apply it to this session.
pub struct SaveAutoLockTimeHandler;

#[async_trait]
impl Handler for SaveAutoLockTimeHandler {
    #[instrument(skip_all, fields(message_type = "settings.saveAutoLockTime"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let params: SaveAutoLockParams = parse(payload)?;
        let minutes = params.auto_lock_time;
        let _ = ctx.session.services.settings.set_auto_lock_minutes(minutes)?;
        ctx.session.lock.apply_auto_lock(minutes).await?;
        info!(minutes, "auto-lock timeout saved");
        Ok(Reply::Value(to_value(&ctx.session.lock.state())?))
    }
}
