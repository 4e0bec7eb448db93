//! Approval handlers: queue a request, then approve or reject it.
//!
//! The request handlers park the caller on a [`crate::pending::Ticket`] and
//! return only once an approver settles the entry. Approve and reject are
//! plain calls that settle by id, scoped to the workflow they belong to.

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info, instrument};
use warden_core::RequestId;

use crate::dispatch::params::{require, require_str};
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::pending::{ApprovalKind, Rejection};
use crate::types::Reply;

const DEFAULT_REJECTION: &str = "Rejected by user";

fn request_id(payload: &Value) -> Result<RequestId, BrokerError> {
    Ok(RequestId::from(require_str(payload, "id")?))
}

fn rejection_message(payload: &Value) -> String {
    payload
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_REJECTION)
        .to_owned()
}

/// Queue an approval request of one kind and wait for its settlement.
///
/// The payload's `id`, when present, becomes the request id; otherwise one
/// is generated.
pub struct RequestApprovalHandler(pub ApprovalKind);

#[async_trait]
impl Handler for RequestApprovalHandler {
    #[instrument(skip_all, fields(kind = %self.0))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        if self.0 == ApprovalKind::Signing {
            let _ = require_str(&payload, "address")?;
        }
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.is_empty() => RequestId::from(id),
            _ => RequestId::new(),
        };
        let ticket = ctx.session.pending.enqueue(id, self.0, payload)?;
        debug!(request_id = %ticket.id(), "waiting for approval");
        let value = ticket.wait().await?;
        Ok(Reply::Value(value))
    }
}

/// Approve a pending request of one kind.
///
/// Result delivered to the requester, by kind:
/// - metadata: `true`
/// - authorize, walletConnect: `{ accounts }`
/// - external: the payload's `result`
/// - signing: `{ id, signature }`
pub struct ApproveHandler(pub ApprovalKind);

impl ApproveHandler {
    fn approval_value(&self, id: &RequestId, payload: &Value) -> Result<Value, BrokerError> {
        match self.0 {
            ApprovalKind::Metadata => Ok(json!(true)),
            ApprovalKind::Authorize | ApprovalKind::WalletConnect => {
                let accounts = require(payload, "accounts")?;
                if !accounts.is_array() {
                    return Err(BrokerError::invalid_params("field 'accounts' must be an array"));
                }
                Ok(json!({ "accounts": accounts }))
            }
            ApprovalKind::External => Ok(require(payload, "result")?.clone()),
            ApprovalKind::Signing => Ok(json!({
                "id": id,
                "signature": require_str(payload, "signature")?,
            })),
        }
    }
}

#[async_trait]
impl Handler for ApproveHandler {
    #[instrument(skip_all, fields(kind = %self.0))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = request_id(&payload)?;
        let value = self.approval_value(&id, &payload)?;
        ctx.session.pending.settle(&id, Some(self.0), Ok(value))?;
        Ok(Reply::Value(json!(true)))
    }
}

/// Reject a pending request of one kind.
///
/// Signing requests are reported to the requester as cancelled, everything
/// else as rejected by the user.
pub struct RejectHandler(pub ApprovalKind);

#[async_trait]
impl Handler for RejectHandler {
    #[instrument(skip_all, fields(kind = %self.0))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = request_id(&payload)?;
        let rejection = if self.0 == ApprovalKind::Signing {
            Rejection::Cancelled {
                message: Some(rejection_message(&payload)),
            }
        } else {
            Rejection::UserRejected {
                message: rejection_message(&payload),
            }
        };
        ctx.session.pending.settle(&id, Some(self.0), Err(rejection))?;
        Ok(Reply::Value(json!(true)))
    }
}

/// Reject or silently dismiss an external-signer request.
///
/// With `throwError` the requester sees a user rejection carrying `error`;
/// without it the request is cancelled with no message.
pub struct ExternalRejectHandler;

#[async_trait]
impl Handler for ExternalRejectHandler {
    #[instrument(skip_all, fields(message_type = "external.reject"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = request_id(&payload)?;
        let throw = payload
            .get("throwError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let rejection = if throw {
            Rejection::UserRejected {
                message: payload
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_REJECTION)
                    .to_owned(),
            }
        } else {
            Rejection::Cancelled { message: None }
        };
        ctx.session
            .pending
            .settle(&id, Some(ApprovalKind::External), Err(rejection))?;
        Ok(Reply::Value(json!(true)))
    }
}

/// Approve a signing request by signing with the keyring.
///
/// The request is claimed for the duration of the signature; a signing
/// failure puts it back in the queue so the approver can retry.
pub struct ApprovePasswordHandler;

#[async_trait]
impl Handler for ApprovePasswordHandler {
    #[instrument(skip_all, fields(message_type = "signing.approvePassword"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = request_id(&payload)?;
        let password = payload
            .get("password")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned);

        let claim = ctx.session.pending.claim(&id, ApprovalKind::Signing)?;
        let request = claim.summary().payload.clone();
        let address = require_str(&request, "address")?;
        let signature = ctx
            .session
            .services
            .keyring
            .sign(address, &request, password)
            .await?;
        claim.resolve(json!({ "id": id, "signature": signature }));
        info!(request_id = %id, "signing request approved");

        let _ = ctx.session.lock.lock_if_always(false).await?;
        Ok(Reply::Value(json!(true)))
    }
}

/// Approve a signing request with an externally produced signature.
pub struct ApproveSignatureHandler;

#[async_trait]
impl Handler for ApproveSignatureHandler {
    #[instrument(skip_all, fields(message_type = "signing.approveSignature"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = request_id(&payload)?;
        let mut result = json!({
            "id": id,
            "signature": require_str(&payload, "signature")?,
        });
        if let Some(signed) = payload.get("signedTransaction").filter(|v| !v.is_null()) {
            result["signedTransaction"] = signed.clone();
        }
        ctx.session
            .pending
            .settle(&id, Some(ApprovalKind::Signing), Ok(result))?;

        let _ = ctx.session.lock.lock_if_always(false).await?;
        Ok(Reply::Value(json!(true)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::dispatch::handlers::test_helpers::TestSession;
    use crate::pending::RequestStatus;
    use crate::testing::MemoryServices;
    use crate::types::Reply;
    use assert_matches::assert_matches;
    use tokio::task::JoinHandle;
    use warden_settings::{LockSettings, WardenSettings};

    fn spawn_request(session: &TestSession, message_type: &'static str, payload: Value) -> JoinHandle<Result<Reply, BrokerError>> {
        let broker = Arc::clone(&session.broker);
        let channel_id = session.channel.id().clone();
        tokio::spawn(async move { broker.handle(&channel_id, "origin", message_type, payload).await })
    }

    async fn wait_pending(session: &TestSession, n: usize) {
        while session.broker.state().pending.len() < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn signing_approved_with_password() {
        let session = TestSession::new().await;
        let request = spawn_request(
            &session,
            "signing.request",
            json!({"id": "req-1", "address": "0xabc", "payload": "0x00"}),
        );
        wait_pending(&session, 1).await;

        let ok = session
            .value("signing.approvePassword", json!({"id": "req-1", "password": "pw"}))
            .await;
        assert_eq!(ok, json!(true));

        let reply = request.await.unwrap().unwrap().into_value();
        assert_eq!(reply["id"], "req-1");
        assert!(reply["signature"].as_str().unwrap().starts_with("0x"));

        let id = RequestId::from("req-1");
        assert_eq!(session.broker.state().pending.status(&id), Some(RequestStatus::Resolved));
        assert_matches!(
            session.call("signing.cancel", json!({"id": "req-1"})).await,
            Err(BrokerError::AlreadySettled { .. })
        );
    }

    #[tokio::test]
    async fn wrong_password_leaves_request_pending() {
        let session = TestSession::new().await;
        let request = spawn_request(
            &session,
            "signing.request",
            json!({"id": "req-2", "address": "0xabc"}),
        );
        wait_pending(&session, 1).await;

        assert_matches!(
            session
                .call("signing.approvePassword", json!({"id": "req-2", "password": "bad"}))
                .await,
            Err(BrokerError::LockPolicy { .. })
        );
        assert_eq!(session.broker.state().pending.len(), 1);

        let _ = session
            .value("signing.cancel", json!({"id": "req-2", "message": "nope"}))
            .await;
        assert_matches!(
            request.await.unwrap(),
            Err(BrokerError::Cancelled { message: Some(m) }) if m == "nope"
        );
    }

    #[tokio::test]
    async fn signing_request_requires_address() {
        let session = TestSession::new().await;
        assert_matches!(
            session.call("signing.request", json!({"id": "x"})).await,
            Err(BrokerError::InvalidParams { .. })
        );
        assert!(session.broker.state().pending.is_empty());
    }

    #[tokio::test]
    async fn external_signature_and_always_lock() {
        let settings = WardenSettings {
            lock: LockSettings { time_auto_lock: 0 },
            ..WardenSettings::default()
        };
        let session = TestSession::with_services(MemoryServices::new("pw", settings)).await;
        let request = spawn_request(
            &session,
            "signing.request",
            json!({"id": "req-3", "address": "0xabc"}),
        );
        wait_pending(&session, 1).await;

        let _ = session
            .value(
                "signing.approveSignature",
                json!({"id": "req-3", "signature": "0xsig", "signedTransaction": "0xtx"}),
            )
            .await;
        let reply = request.await.unwrap().unwrap().into_value();
        assert_eq!(reply, json!({"id": "req-3", "signature": "0xsig", "signedTransaction": "0xtx"}));
        assert!(session.broker.state().lock.is_locked());
    }

    #[tokio::test]
    async fn authorize_and_metadata_flows() {
        let session = TestSession::new().await;
        let auth = spawn_request(&session, "authorize.request", json!({"id": "a-1", "origin": "dapp"}));
        let meta = spawn_request(&session, "metadata.request", json!({"id": "m-1", "chain": "polkadot"}));
        wait_pending(&session, 2).await;

        // Kind-scoped: a metadata approve cannot settle an authorize request.
        assert_matches!(
            session.call("metadata.approve", json!({"id": "a-1"})).await,
            Err(BrokerError::NotFound { .. })
        );
        assert_matches!(
            session.call("authorize.approve", json!({"id": "a-1", "accounts": "0xa"})).await,
            Err(BrokerError::InvalidParams { .. })
        );

        let _ = session
            .value("authorize.approve", json!({"id": "a-1", "accounts": ["0xa"]}))
            .await;
        let _ = session.value("metadata.reject", json!({"id": "m-1"})).await;

        assert_eq!(auth.await.unwrap().unwrap().into_value(), json!({"accounts": ["0xa"]}));
        assert_matches!(
            meta.await.unwrap(),
            Err(BrokerError::UserRejected { message }) if message == DEFAULT_REJECTION
        );
    }

    #[tokio::test]
    async fn external_reject_modes() {
        let session = TestSession::new().await;
        let loud = spawn_request(&session, "external.request", json!({"id": "e-1"}));
        let quiet = spawn_request(&session, "external.request", json!({"id": "e-2"}));
        let ok = spawn_request(&session, "external.request", json!({"id": "e-3"}));
        wait_pending(&session, 3).await;

        let _ = session
            .value("external.reject", json!({"id": "e-1", "throwError": true, "error": "device busy"}))
            .await;
        let _ = session.value("external.reject", json!({"id": "e-2"})).await;
        let _ = session
            .value("external.resolve", json!({"id": "e-3", "result": {"signature": "0x1"}}))
            .await;

        assert_matches!(loud.await.unwrap(), Err(BrokerError::UserRejected { message }) if message == "device busy");
        assert_matches!(quiet.await.unwrap(), Err(BrokerError::Cancelled { message: None }));
        assert_eq!(ok.await.unwrap().unwrap().into_value(), json!({"signature": "0x1"}));
    }

    #[tokio::test]
    async fn wallet_connect_rejection() {
        let session = TestSession::new().await;
        let proposal = spawn_request(&session, "walletConnect.proposal", json!({"id": "w-1"}));
        wait_pending(&session, 1).await;
        let _ = session
            .value("walletConnect.reject", json!({"id": "w-1", "message": "not now"}))
            .await;
        assert_matches!(
            proposal.await.unwrap(),
            Err(BrokerError::UserRejected { message }) if message == "not now"
        );
        assert_matches!(
            session.call("walletConnect.approve", json!({"id": "w-1", "accounts": []})).await,
            Err(BrokerError::AlreadySettled { .. })
        );
    }

    #[tokio::test]
    async fn duplicate_request_id_is_rejected() {
        let session = TestSession::new().await;
        let _first = spawn_request(&session, "metadata.request", json!({"id": "dup"}));
        wait_pending(&session, 1).await;
        assert_matches!(
            session.call("metadata.request", json!({"id": "dup"})).await,
            Err(BrokerError::InvalidParams { .. })
        );
    }
}
