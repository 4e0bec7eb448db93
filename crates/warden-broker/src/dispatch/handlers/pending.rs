//! Pending queue handlers: get, subscribe, generic settle.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;
use warden_core::RequestId;

use crate::dispatch::handlers::{subscribe_watch, to_value};
use crate::dispatch::params::{parse, require_str};
use crate::dispatch::{Handler, HandlerContext};
use crate::errors::BrokerError;
use crate::pending::{ApprovalKind, PendingSummary, Rejection};
use crate::types::Reply;

/// One pending request by id.
pub struct GetPendingHandler;

#[async_trait]
impl Handler for GetPendingHandler {
    #[instrument(skip_all, fields(message_type = "pending.get"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let id = RequestId::from(require_str(&payload, "id")?);
        let summary = ctx.session.pending.get(&id)?;
        Ok(Reply::Value(to_value(&summary)?))
    }
}

#[derive(Deserialize, Default)]
struct SubscribeParams {
    #[serde(default)]
    kind: Option<ApprovalKind>,
}

/// Pending list, optionally filtered by kind, plus every later change.
pub struct SubscribePendingHandler;

#[async_trait]
impl Handler for SubscribePendingHandler {
    #[instrument(skip_all, fields(message_type = "pending.subscribe"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let params: SubscribeParams = if payload.is_null() {
            SubscribeParams::default()
        } else {
            parse(payload)?
        };
        let kind = params.kind;
        let rx = ctx.session.pending.subscribe();
        Ok(subscribe_watch(ctx, rx, move |list: &Vec<PendingSummary>| {
            let filtered: Vec<&PendingSummary> = list
                .iter()
                .filter(|s| kind.is_none_or(|k| s.kind == k))
                .collect();
            serde_json::to_value(filtered).unwrap_or(Value::Null)
        }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SettleParams {
    id: String,
    approve: bool,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

/// Approve or reject any pending request by id.
pub struct SettlePendingHandler;

#[async_trait]
impl Handler for SettlePendingHandler {
    #[instrument(skip_all, fields(message_type = "pending.settle"))]
    async fn handle(&self, payload: Value, ctx: &HandlerContext) -> Result<Reply, BrokerError> {
        let params: SettleParams = parse(payload)?;
        let id = RequestId::from(params.id);
        let outcome = if params.approve {
            Ok(params.value.unwrap_or(json!(true)))
        } else {
            Err(Rejection::UserRejected {
                message: params.message.unwrap_or_else(|| "Rejected by user".to_owned()),
            })
        };
        ctx.session.pending.settle(&id, None, outcome)?;
        Ok(Reply::Value(json!(true)))
    }
}
