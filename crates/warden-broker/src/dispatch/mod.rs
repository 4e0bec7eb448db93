//! Dispatch table: the closed set of message types and their handlers.
//!
//! Every inbound message passes through [`DispatchTable::dispatch`], which
//! restarts the idle timer, looks up the handler, and turns handler errors
//! into the uniform envelope. Routing does nothing else.

pub mod handlers;
pub mod params;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, error, instrument, warn};

use crate::broker::SessionState;
use crate::channel::Channel;
use crate::errors::BrokerError;
use crate::subscriptions::ReplyBarrier;
use crate::types::Reply;

/// How a message type interacts with the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Single reply.
    Call,
    /// Current value plus a live subscription.
    Subscribe,
    /// Reply only after out-of-band settlement.
    Approval,
}

macro_rules! message_types {
    ($($(#[$meta:meta])* $variant:ident => $name:literal, $shape:ident;)*) => {
        /// Every supported message type.
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($(#[$meta])* $variant,)*
        }

        impl MessageType {
            /// The closed set, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant,)*];

            /// Wire name.
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            /// Interaction shape.
            pub fn shape(self) -> Shape {
                match self {
                    $(Self::$variant => Shape::$shape,)*
                }
            }

            /// Look up a wire name.
            pub fn parse(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(Self::$variant),)*
                    _ => None,
                }
            }
        }
    };
}

message_types! {
    /// Liveness check.
    Ping => "ping", Call;
    /// Keyring lock flag.
    KeyringState => "keyring.state", Call;
    /// Unlock with the master password.
    KeyringUnlock => "keyring.unlock", Call;
    /// Lock now.
    KeyringLock => "keyring.lock", Call;
    /// Stream of lock transitions.
    KeyringLockSubscribe => "keyring.lockSubscribe", Subscribe;
    /// Change or create the master password.
    KeyringChangeMasterPassword => "keyring.changeMasterPassword", Call;
    /// Move an account under the master password.
    KeyringMigratePassword => "keyring.migratePassword", Call;
    /// Create an account from a secret.
    AccountCreate => "account.create", Call;
    /// Derive a child account.
    AccountDerive => "account.derive", Call;
    /// Start a background account sync.
    AccountSync => "account.sync", Call;
    /// Current settings.
    SettingsGet => "settings.get", Call;
    /// Stream of settings.
    SettingsSubscribe => "settings.subscribe", Subscribe;
    /// Persist the idle-lock timeout.
    SettingsSaveAutoLockTime => "settings.saveAutoLockTime", Call;
    /// Lock policy snapshot.
    LockState => "lock.state", Call;
    /// Chain info.
    ChainGetInfo => "chain.getInfo", Call;
    /// Stream of chain state.
    ChainSubscribeState => "chain.subscribeState", Subscribe;
    /// Build and submit a transaction.
    TransactionSubmit => "transaction.submit", Call;
    /// Queue a signing request and wait for approval.
    SigningRequest => "signing.request", Approval;
    /// Approve a signing request by signing with the keyring.
    SigningApprovePassword => "signing.approvePassword", Call;
    /// Approve a signing request with an externally produced signature.
    SigningApproveSignature => "signing.approveSignature", Call;
    /// Refuse a signing request.
    SigningCancel => "signing.cancel", Call;
    /// Queue a metadata import and wait for approval.
    MetadataRequest => "metadata.request", Approval;
    /// Approve a metadata import.
    MetadataApprove => "metadata.approve", Call;
    /// Refuse a metadata import.
    MetadataReject => "metadata.reject", Call;
    /// Queue a site authorization and wait for approval.
    AuthorizeRequest => "authorize.request", Approval;
    /// Authorize a site for accounts.
    AuthorizeApprove => "authorize.approve", Call;
    /// Refuse a site authorization.
    AuthorizeReject => "authorize.reject", Call;
    /// Queue a QR/hardware request and wait for its result.
    ExternalRequest => "external.request", Approval;
    /// Supply the external device's result.
    ExternalResolve => "external.resolve", Call;
    /// Reject or dismiss an external request.
    ExternalReject => "external.reject", Call;
    /// Queue a wallet-connect session proposal.
    WalletConnectProposal => "walletConnect.proposal", Approval;
    /// Approve a wallet-connect session.
    WalletConnectApprove => "walletConnect.approve", Call;
    /// Refuse a wallet-connect session.
    WalletConnectReject => "walletConnect.reject", Call;
    /// One pending request.
    PendingGet => "pending.get", Call;
    /// Stream of pending requests.
    PendingSubscribe => "pending.subscribe", Subscribe;
    /// Generic approve/reject by id.
    PendingSettle => "pending.settle", Call;
    /// Cancel a subscription.
    SubscriptionCancel => "subscription.cancel", Call;
}

/// Per-request context handed to handlers.
pub struct HandlerContext {
    /// Session-wide state.
    pub session: Arc<SessionState>,
    /// Channel the request arrived on.
    pub channel: Arc<Channel>,
    /// Caller's request id.
    pub request_id: String,
    /// Released once the response to this request is queued.
    pub ready: ReplyBarrier,
}

/// A message handler.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handle one request.
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError>;
}

/// Static mapping from message type to handler.
pub struct DispatchTable {
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
    call_timeout: Duration,
}

impl DispatchTable {
    /// Empty table. Plain calls are bounded by `call_timeout`.
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            handlers: HashMap::new(),
            call_timeout,
        }
    }

    /// Table with every built-in handler, checked for exhaustiveness.
    pub fn with_builtin_handlers(call_timeout: Duration) -> Result<Self, BrokerError> {
        let mut table = Self::new(call_timeout);
        handlers::register_all(&mut table);
        table.verify()?;
        Ok(table)
    }

    /// Bind a handler.
    pub fn register(&mut self, message_type: MessageType, handler: impl Handler + 'static) {
        let _ = self.handlers.insert(message_type, Arc::new(handler));
    }

    /// Fail if any message type lacks a handler.
    pub fn verify(&self) -> Result<(), BrokerError> {
        let missing: Vec<&str> = MessageType::ALL
            .iter()
            .filter(|t| !self.handlers.contains_key(*t))
            .map(|t| t.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::internal(format!(
                "no handler registered for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Whether `message_type` has a handler.
    pub fn has_handler(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Route one request.
    #[instrument(
        skip_all,
        fields(channel_id = %ctx.channel.id(), request_id = %ctx.request_id, message_type = %message_type)
    )]
    pub async fn dispatch(
        &self,
        ctx: &HandlerContext,
        message_type: &str,
        payload: Value,
    ) -> Result<Reply, BrokerError> {
        ctx.session.lock.touch();

        let Some(kind) = MessageType::parse(message_type) else {
            counter!("broker_dispatch_total", "type" => "unsupported").increment(1);
            counter!(
                "broker_dispatch_errors_total",
                "type" => "unsupported",
                "code" => crate::errors::UNSUPPORTED_MESSAGE_TYPE
            )
            .increment(1);
            warn!(message_type, "unsupported message type");
            return Err(BrokerError::UnsupportedMessageType {
                message_type: message_type.to_owned(),
            });
        };
        let Some(handler) = self.handlers.get(&kind) else {
            error!(message_type, "message type has no handler");
            return Err(BrokerError::UnsupportedMessageType {
                message_type: message_type.to_owned(),
            });
        };

        let label = kind.as_str();
        counter!("broker_dispatch_total", "type" => label).increment(1);
        debug!(shape = ?kind.shape(), "routing");

        let start = Instant::now();
        let result = match kind.shape() {
            Shape::Approval => handler.handle(payload, ctx).await,
            Shape::Call | Shape::Subscribe => {
                match tokio::time::timeout(self.call_timeout, handler.handle(payload, ctx)).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        error!(timeout = ?self.call_timeout, "handler timed out");
                        Err(BrokerError::internal(format!(
                            "handler for '{label}' timed out"
                        )))
                    }
                }
            }
        };
        histogram!("broker_dispatch_duration_seconds", "type" => label)
            .record(start.elapsed().as_secs_f64());

        if let Err(err) = &result {
            counter!("broker_dispatch_errors_total", "type" => label, "code" => err.code())
                .increment(1);
            debug!(code = err.code(), error = %err, "handler failed");
        }
        result
    }
}
