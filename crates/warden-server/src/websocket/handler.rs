//! Frame parsing and per-request dispatch.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};
use warden_broker::{BrokerError, Channel, ChannelMessage, InboundMessage, Response, SessionBroker};

use crate::metrics::WS_INVALID_FRAMES_TOTAL;

/// Id used on responses to frames that could not be parsed.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// Parse one text frame as `{id, type, payload?}`.
///
/// On failure, returns the `INVALID_PARAMS` response to send back.
pub fn parse_frame(text: &str) -> Result<InboundMessage, Response> {
    serde_json::from_str(text).map_err(|e| {
        Response::failure(
            UNKNOWN_REQUEST_ID,
            &BrokerError::invalid_params(format!("invalid message: {e}")),
        )
    })
}

/// Parse `text` and dispatch it on its own task, so a request awaiting
/// approval never blocks later frames on the same channel.
pub fn dispatch_frame(broker: &Arc<SessionBroker>, channel: &Arc<Channel>, text: &str) {
    match parse_frame(text) {
        Ok(message) => {
            debug!(
                channel_id = %channel.id(),
                request_id = %message.id,
                message_type = %message.message_type,
                "frame received"
            );
            let broker = Arc::clone(broker);
            let channel = Arc::clone(channel);
            drop(tokio::spawn(async move {
                let _ = broker.handle_message(&channel, message).await;
            }));
        }
        Err(response) => reject_frame(channel, response),
    }
}

/// Answer an unusable frame.
pub fn reject_frame(channel: &Channel, response: Response) {
    counter!(WS_INVALID_FRAMES_TOTAL).increment(1);
    warn!(channel_id = %channel.id(), "invalid frame received");
    let _ = channel.send(ChannelMessage::Response(response));
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use warden_broker::BrokerConfig;
    use warden_broker::testing::MemoryServices;
    use warden_settings::WardenSettings;

    #[test]
    fn valid_frame_parses() {
        let msg = parse_frame(r#"{"id":"r1","type":"ping","payload":{"x":1}}"#).unwrap();
        assert_eq!(msg.id, "r1");
        assert_eq!(msg.message_type, "ping");
        assert_eq!(msg.payload["x"], 1);
    }

    #[test]
    fn payload_is_optional() {
        let msg = parse_frame(r#"{"id":"r2","type":"keyring.state"}"#).unwrap();
        assert_eq!(msg.payload, Value::Null);
    }

    #[test]
    fn malformed_frames_answer_invalid_params() {
        for text in ["not json", "", "[1,2,3]", r#"{"type":"ping"}"#, r#"{"id":"r3"}"#] {
            let resp = parse_frame(text).unwrap_err();
            assert_eq!(resp.id, UNKNOWN_REQUEST_ID);
            assert!(!resp.success);
            let err = resp.error.unwrap();
            assert_eq!(err.code, "INVALID_PARAMS");
            assert!(err.message.contains("invalid message"), "{text}");
        }
    }

    #[tokio::test]
    async fn dispatch_replies_on_the_channel() {
        let services = MemoryServices::new("pw", WardenSettings::default());
        let broker = SessionBroker::new(BrokerConfig::default(), services.services())
            .await
            .unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let channel = broker.open_channel(tx);

        dispatch_frame(&broker, &channel, "{oops");
        let bad = assert_matches!(rx.recv().await, Some(ChannelMessage::Response(r)) => r);
        assert_eq!(bad.id, UNKNOWN_REQUEST_ID);

        dispatch_frame(&broker, &channel, &json!({"id": "7", "type": "ping"}).to_string());
        let ok = assert_matches!(rx.recv().await, Some(ChannelMessage::Response(r)) => r);
        assert_eq!(ok.id, "7");
        assert!(ok.success);
        assert_eq!(ok.result.unwrap()["pong"], true);
    }
}
