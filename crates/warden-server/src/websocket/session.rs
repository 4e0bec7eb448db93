//! One WebSocket connection, from upgrade through disconnect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use warden_broker::{BrokerError, ChannelEvent, ChannelMessage, Response, SessionBroker};

use super::handler::{UNKNOWN_REQUEST_ID, dispatch_frame, reject_frame};
use super::heartbeat::Heartbeat;
use crate::config::MAX_MISSED_PINGS;
use crate::metrics::{WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};

/// First event on every channel; `data.channelId` names the channel.
pub const CHANNEL_ESTABLISHED: &str = "channel.established";

/// Per-connection knobs.
#[derive(Clone, Copy, Debug)]
pub struct SessionOptions {
    /// Outbound queue depth.
    pub channel_buffer: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
}

/// Why the writer stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Disconnect {
    Closed,
    Timeout,
    SendFailed,
    Shutdown,
}

impl Disconnect {
    fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Timeout => "timeout",
            Self::SendFailed => "send_failed",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a channel over `socket` until either side hangs up, the client
/// stops answering pings, or `shutdown` fires.
///
/// Every text frame is dispatched on its own task. On exit the channel is
/// closed, which tears down its subscriptions; its pending requests stay
/// queued for other surfaces.
#[instrument(skip_all)]
pub async fn run_session(
    socket: WebSocket,
    broker: Arc<SessionBroker>,
    options: SessionOptions,
    shutdown: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel::<ChannelMessage>(options.channel_buffer.max(1));
    let channel = broker.open_channel(tx);
    let channel_id = channel.id().clone();
    let started = Instant::now();

    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);
    info!(channel_id = %channel_id, "client connected");

    let _ = channel.send(ChannelMessage::Event(ChannelEvent::notice(
        CHANNEL_ESTABLISHED,
        json!({ "channelId": channel_id }),
    )));

    let (mut ws_tx, mut ws_rx) = socket.split();
    let heartbeat = Arc::new(Heartbeat::new(MAX_MISSED_PINGS));
    let conn_token = shutdown.child_token();

    let writer = {
        let heartbeat = Arc::clone(&heartbeat);
        let token = conn_token.clone();
        let shutdown = shutdown.clone();
        let channel_id = channel_id.clone();
        tokio::spawn(async move {
            let mut ping = tokio::time::interval(options.ping_interval);
            ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // first tick completes immediately
            let _ = ping.tick().await;

            let reason = loop {
                tokio::select! {
                    () = token.cancelled() => {
                        break if shutdown.is_cancelled() { Disconnect::Shutdown } else { Disconnect::Closed };
                    }
                    message = rx.recv() => {
                        let Some(message) = message else { break Disconnect::Closed };
                        let text = match serde_json::to_string(&message) {
                            Ok(text) => text,
                            Err(e) => {
                                error!(channel_id = %channel_id, error = %e, "failed to serialize outbound message");
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break Disconnect::SendFailed;
                        }
                    }
                    _ = ping.tick() => {
                        if !heartbeat.tick() {
                            warn!(channel_id = %channel_id, missed = heartbeat.missed(), "client unresponsive, disconnecting");
                            break Disconnect::Timeout;
                        }
                        if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                            break Disconnect::SendFailed;
                        }
                    }
                }
            };
            let _ = ws_tx.send(Message::Close(None)).await;
            token.cancel();
            reason
        })
    };

    loop {
        let frame = tokio::select! {
            () = conn_token.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let Some(Ok(frame)) = frame else { break };
        heartbeat.mark_alive();
        match frame {
            Message::Text(text) => dispatch_frame(&broker, &channel, text.as_str()),
            Message::Binary(data) => match std::str::from_utf8(&data) {
                Ok(text) => dispatch_frame(&broker, &channel, text),
                Err(_) => {
                    debug!(channel_id = %channel_id, len = data.len(), "non-UTF-8 binary frame");
                    reject_frame(
                        &channel,
                        Response::failure(
                            UNKNOWN_REQUEST_ID,
                            &BrokerError::invalid_params("binary frame is not valid UTF-8"),
                        ),
                    );
                }
            },
            Message::Close(_) => {
                debug!(channel_id = %channel_id, "client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    conn_token.cancel();
    let reason = writer.await.unwrap_or(Disconnect::Closed);
    let torn_down = broker.close_channel(&channel_id);

    counter!(WS_DISCONNECTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!("ws_connection_duration_seconds").record(started.elapsed().as_secs_f64());
    info!(
        channel_id = %channel_id,
        reason = reason.as_str(),
        subscriptions = torn_down,
        "client disconnected"
    );
}
