//! Keyring handlers: state, unlock, lock, lock subscription, master password.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::dispatch::handlers::subscribe_watch;
use crate::dispatch::params::{parse, require_str};
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::lock::LockReason;
use crate::types::Reply;

/// Whether the keyring is locked.
pub struct KeyringStateHandler;

#[async_trait]
impl Handler for KeyringStateHandler {
    #[instrument(skip_all, fields(message_type = "keyring.state"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let locked = ctx.session.services.keyring.is_locked().await;
        Ok(Reply::Value(json!({ "locked": locked })))
    }
}

/// Unlock with the master password.
pub struct UnlockHandler;

#[async_trait]
impl Handler for UnlockHandler {
    #[instrument(skip_all, fields(message_type = "keyring.unlock"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let password = require_str(&payload, "password")?;
        ctx.session.lock.unlock(password).await?;
        Ok(Reply::Value(json!({ "locked": false })))
    }
}

/// Lock immediately.
pub struct LockHandler;

#[async_trait]
impl Handler for LockHandler {
    #[instrument(skip_all, fields(message_type = "keyring.lock"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        ctx.session.lock.lock(LockReason::Explicit).await?;
        Ok(Reply::Value(json!({ "locked": true })))
    }
}

/// Current lock flag plus every later transition.
pub struct LockSubscribeHandler;

#[async_trait]
impl Handler for LockSubscribeHandler {
    #[instrument(skip_all, fields(message_type = "keyring.lockSubscribe"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let rx = ctx.session.lock.subscribe();
        Ok(subscribe_watch(ctx, rx, |locked| json!(locked)))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordParams {
    #[serde(default)]
    old_password: Option<String>,
    new_password: String,
    #[serde(default)]
    create_new: bool,
}

/// Change the master password, or create it on first run.
pub struct ChangeMasterPasswordHandler;

#[async_trait]
impl Handler for ChangeMasterPasswordHandler {
    #[instrument(skip_all, fields(message_type = "keyring.changeMasterPassword"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let params: ChangePasswordParams = parse(payload)?;
        if params.new_password.is_empty() {
            return Err(BrokerError::invalid_params("newPassword must not be empty"));
        }
        ctx.session
            .services
            .keyring
            .change_master_password(params.old_password, &params.new_password)
            .await?;
        info!(create_new = params.create_new, "master password changed");

        let locked = ctx.session.lock.lock_if_always(params.create_new).await?;
        Ok(Reply::Value(json!({ "status": true, "locked": locked })))
    }
}

/// Move one account under the master password.
pub struct MigratePasswordHandler;

#[async_trait]
impl Handler for MigratePasswordHandler {
    #[instrument(skip_all, fields(message_type = "keyring.migratePassword"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let address = require_str(&payload, "address")?;
        let password = require_str(&payload, "password")?;
        let remaining = ctx
            .session
            .services
            .keyring
            .migrate_password(address, password)
            .await?;

        let locked = if remaining == 0 {
            ctx.session.lock.lock_if_always(false).await?
        } else {
            false
        };
        Ok(Reply::Value(json!({ "remaining": remaining, "locked": locked })))
    }
}
