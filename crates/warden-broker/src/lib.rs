//! # warden-broker
//!
//! Session broker for the Warden wallet: the single place every UI surface
//! talks to.
//!
//! - **Lock policy**: idle timer (`timer`) and lock controller (`lock`),
//!   including the "always lock" mode and skip-auto-lock suppression
//! - **Subscriptions**: per-channel registry with synchronous teardown
//! - **Pending queue**: approval-gated requests settled at most once
//! - **Dispatch**: the closed set of message types, verified exhaustive at
//!   startup
//! - **Broker**: composition root owning one `SessionState`; no globals
//!
//! Keys, chains and transactions live behind the traits in `collaborators`.
//! `testing` holds in-memory implementations.

#![deny(unsafe_code)]

pub mod broker;
pub mod channel;
pub mod collaborators;
pub mod dispatch;
pub mod errors;
pub mod lock;
pub mod pending;
pub mod subscriptions;
pub mod testing;
pub mod timer;
pub mod types;

pub use broker::{BrokerConfig, BrokerStats, SessionBroker, SessionState};
pub use channel::{Channel, ChannelRegistry};
pub use collaborators::{
    ChainRegistry, ChainStateFeed, CollaboratorError, Keyring, Services, TransactionService,
};
pub use dispatch::{DispatchTable, Handler, HandlerContext, MessageType, Shape};
pub use errors::BrokerError;
pub use lock::{LockController, LockReason, LockState};
pub use pending::{ApprovalKind, PendingQueue, PendingSummary, Rejection, RequestStatus};
pub use subscriptions::{ReplyBarrier, ReplyLatch, SubscriptionRegistry};
pub use types::{ChannelEvent, ChannelMessage, ErrorBody, InboundMessage, Reply, Response};
