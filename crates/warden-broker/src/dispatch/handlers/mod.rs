//! Message handler modules and registration.

pub mod account;
pub mod approvals;
pub mod chain;
pub mod keyring;
pub mod pending;
pub mod settings;
pub mod system;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::dispatch::{DispatchTable, HandlerContext, MessageType};
use crate::errors::BrokerError;
use crate::pending::ApprovalKind;
use crate::types::Reply;

/// Register every built-in handler.
pub fn register_all(table: &mut DispatchTable) {
    // System
    table.register(MessageType::Ping, system::PingHandler);
    table.register(MessageType::LockState, system::LockStateHandler);
    table.register(MessageType::SubscriptionCancel, system::CancelSubscriptionHandler);

    // Keyring
    table.register(MessageType::KeyringState, keyring::KeyringStateHandler);
    table.register(MessageType::KeyringUnlock, keyring::UnlockHandler);
    table.register(MessageType::KeyringLock, keyring::LockHandler);
    table.register(MessageType::KeyringLockSubscribe, keyring::LockSubscribeHandler);
    table.register(
        MessageType::KeyringChangeMasterPassword,
        keyring::ChangeMasterPasswordHandler,
    );
    table.register(MessageType::KeyringMigratePassword, keyring::MigratePasswordHandler);

    // Accounts
    table.register(MessageType::AccountCreate, account::CreateAccountHandler);
    table.register(MessageType::AccountDerive, account::DeriveAccountHandler);
    table.register(MessageType::AccountSync, account::SyncAccountHandler);

    // Settings
    table.register(MessageType::SettingsGet, settings::GetSettingsHandler);
    table.register(MessageType::SettingsSubscribe, settings::SubscribeSettingsHandler);
    table.register(
        MessageType::SettingsSaveAutoLockTime,
        settings::SaveAutoLockTimeHandler,
    );

    // Chains and transactions
    table.register(MessageType::ChainGetInfo, chain::ChainInfoHandler);
    table.register(MessageType::ChainSubscribeState, chain::SubscribeChainStateHandler);
    table.register(MessageType::TransactionSubmit, chain::SubmitTransactionHandler);

    // Signing
    table.register(
        MessageType::SigningRequest,
        approvals::RequestApprovalHandler(ApprovalKind::Signing),
    );
    table.register(MessageType::SigningApprovePassword, approvals::ApprovePasswordHandler);
    table.register(MessageType::SigningApproveSignature, approvals::ApproveSignatureHandler);
    table.register(
        MessageType::SigningCancel,
        approvals::RejectHandler(ApprovalKind::Signing),
    );

    // Metadata
    table.register(
        MessageType::MetadataRequest,
        approvals::RequestApprovalHandler(ApprovalKind::Metadata),
    );
    table.register(
        MessageType::MetadataApprove,
        approvals::ApproveHandler(ApprovalKind::Metadata),
    );
    table.register(
        MessageType::MetadataReject,
        approvals::RejectHandler(ApprovalKind::Metadata),
    );

    // Authorization
    table.register(
        MessageType::AuthorizeRequest,
        approvals::RequestApprovalHandler(ApprovalKind::Authorize),
    );
    table.register(
        MessageType::AuthorizeApprove,
        approvals::ApproveHandler(ApprovalKind::Authorize),
    );
    table.register(
        MessageType::AuthorizeReject,
        approvals::RejectHandler(ApprovalKind::Authorize),
    );

    // External signers
    table.register(
        MessageType::ExternalRequest,
        approvals::RequestApprovalHandler(ApprovalKind::External),
    );
    table.register(
        MessageType::ExternalResolve,
        approvals::ApproveHandler(ApprovalKind::External),
    );
    table.register(MessageType::ExternalReject, approvals::ExternalRejectHandler);

    // Wallet connect
    table.register(
        MessageType::WalletConnectProposal,
        approvals::RequestApprovalHandler(ApprovalKind::WalletConnect),
    );
    table.register(
        MessageType::WalletConnectApprove,
        approvals::ApproveHandler(ApprovalKind::WalletConnect),
    );
    table.register(
        MessageType::WalletConnectReject,
        approvals::RejectHandler(ApprovalKind::WalletConnect),
    );

    // Pending queue
    table.register(MessageType::PendingGet, pending::GetPendingHandler);
    table.register(MessageType::PendingSubscribe, pending::SubscribePendingHandler);
    table.register(MessageType::PendingSettle, pending::SettlePendingHandler);
}

/// Serialize a handler result.
pub(crate) fn to_value<T: Serialize>(value: &T) -> Result<Value, BrokerError> {
    serde_json::to_value(value).map_err(|e| BrokerError::internal(e.to_string()))
}

/// Reply with the current value of `rx` and forward every later change
/// to the caller's channel.
pub(crate) fn subscribe_watch<T, F>(
    ctx: &HandlerContext,
    mut rx: watch::Receiver<T>,
    project: F,
) -> Reply
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&T) -> Value + Send + Sync + 'static,
{
    let current = project(&rx.borrow_and_update());
    let updates = WatchStream::from_changes(rx).map(move |v| project(&v));
    let subscription_id = ctx.session.subscriptions.subscribe_stream(
        &ctx.channel,
        &ctx.request_id,
        Box::pin(updates),
        ctx.ready.clone(),
    );
    Reply::Subscribed {
        subscription_id,
        current,
    }
}


#[cfg(test)]
mod tests {
    use super::test_helpers::TestSession;
    use super::*;
    use crate::subscriptions::ReplyBarrier;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn to_value_serializes() {
        assert_eq!(to_value(&vec![1, 2]).unwrap(), json!([1, 2]));
    }

    #[tokio::test]
    async fn subscribe_watch_sends_current_then_changes() {
        let mut session = TestSession::new().await;
        let (tx, rx) = watch::channel(1_u32);
        let ctx = HandlerContext {
            session: Arc::clone(session.broker.state()),
            channel: Arc::clone(&session.channel),
            request_id: "sub-1".into(),
            ready: ReplyBarrier::released(),
        };
        let reply = subscribe_watch(&ctx, rx, |n| json!(n * 10));
        let subscription_id = assert_matches!(reply, Reply::Subscribed { subscription_id, current } => {
            assert_eq!(current, json!(10));
            subscription_id
        });

        tx.send(2).unwrap();
        let event = session.next_event().await;
        assert_eq!(event.subscription_id.as_ref(), Some(&subscription_id));
        assert_eq!(event.id.as_deref(), Some("sub-1"));
        assert_eq!(event.data, json!(20));
    }
}
