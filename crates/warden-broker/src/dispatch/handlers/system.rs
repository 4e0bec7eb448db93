//! System handlers: ping, lock state, subscription cancel.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::instrument;
use warden_core::SubscriptionId;

use crate::dispatch::handlers::to_value;
use crate::dispatch::params::require_str;
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::types::Reply;

/// Returns a pong with the current timestamp.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    #[instrument(skip_all, fields(message_type = "ping"))]
    async fn handle(&self, _payload: Value, _ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        Ok(Reply::Value(json!({
            "pong": true,
            "timestamp": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        })))
    }
}

/// Snapshot of the lock policy.
pub struct LockStateHandler;

#[async_trait]
impl Handler for LockStateHandler {
    #[instrument(skip_all, fields(message_type = "lock.state"))]
    async fn handle(&self, _payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        Ok(Reply::Value(to_value(&ctx.session.lock.state())?))
    }
}

/// Cancel one subscription by id.
pub struct CancelSubscriptionHandler;

#[async_trait]
impl Handler for CancelSubscriptionHandler {
    #[instrument(skip_all, fields(message_type = "subscription.cancel"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = SubscriptionId::from(require_str(&payload, "subscriptionId")?);
        let cancelled = ctx.session.subscriptions.cancel(&id);
        Ok(Reply::Value(json!({ "cancelled": cancelled })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::handlers::test_helpers::TestSession;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn ping_pongs() {
        let session = TestSession::new().await;
        let result = session.value("ping", Value::Null).await;
        assert_eq!(result["pong"], true);
        assert!(result["timestamp"].is_string());
    }

    #[tokio::test]
    async fn lock_state_reports_policy() {
        let session = TestSession::new().await;
        let state = session.value("lock.state", json!({})).await;
        assert_eq!(state["timeAutoLock"], 15);
        assert_eq!(state["alwaysLock"], false);
        assert_eq!(state["locked"], false);
    }

    #[tokio::test]
    async fn cancel_subscription() {
        let session = TestSession::new().await;
        let sub = session.value("keyring.lockSubscribe", json!({})).await;
        let id = sub["subscriptionId"].as_str().unwrap().to_owned();
        assert_eq!(session.broker.stats().subscriptions, 1);

        let first = session.value("subscription.cancel", json!({"subscriptionId": id})).await;
        assert_eq!(first["cancelled"], true);
        let second = session.value("subscription.cancel", json!({"subscriptionId": id})).await;
        assert_eq!(second["cancelled"], false);
        assert_eq!(session.broker.stats().subscriptions, 0);

        assert_matches!(
            session.call("subscription.cancel", json!({})).await,
            Err(BrokerError::InvalidParams { .. })
        );
    }
}
