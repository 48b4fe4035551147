//! Consumer side of the platform's realtime service.
//!
//! The service speaks the Phoenix channel protocol over a websocket: the client
//! joins a topic with a `postgres_changes` config, keeps the socket alive with
//! heartbeats, and receives one `postgres_changes` frame per row change.

use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, info, warn};

use super::types::{ChangeEvent, ChangeKind, Subscription};
use crate::error::{Error, Result};

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    table: String,
    #[serde(default)]
    record: Value,
    #[serde(default)]
    old_record: Value,
}

fn topic(channel: &str) -> String {
    format!("realtime:{}", channel)
}

/// `phx_join` frame for a subscription
pub fn join_frame(subscription: &Subscription, access_token: &str, reference: u64) -> Value {
    json!({
        "topic": topic(&subscription.channel),
        "event": "phx_join",
        "payload": {
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": subscription.changes,
            },
            "access_token": access_token,
        },
        "ref": reference.to_string(),
        "join_ref": reference.to_string(),
    })
}

pub fn heartbeat_frame(reference: u64) -> Value {
    json!({
        "topic": "phoenix",
        "event": "heartbeat",
        "payload": {},
        "ref": reference.to_string(),
    })
}

/// Decode one text frame; frames that carry no row change yield `None`
pub fn parse_frame(text: &str) -> Result<Option<ChangeEvent>> {
    let frame: Frame = serde_json::from_str(text)?;
    match frame.event.as_str() {
        "postgres_changes" => {
            let data: ChangeData = serde_json::from_value(frame.payload.get("data").cloned().unwrap_or(Value::Null))?;
            Ok(Some(ChangeEvent {
                table: data.table,
                kind: data.kind,
                record: data.record,
                old_record: data.old_record,
            }))
        }
        "phx_reply" => {
            let status = frame.payload.get("status").and_then(Value::as_str).unwrap_or("");
            if status == "error" {
                let reason = frame.payload.get("response").map(Value::to_string).unwrap_or_default();
                return Err(Error::Realtime(format!("{} rejected: {}", frame.topic, reason)));
            }
            Ok(None)
        }
        "phx_error" => Err(Error::Realtime(format!("{} errored", frame.topic))),
        _ => Ok(None),
    }
}

/// Open a websocket, join the channel, and forward row changes until either side closes
pub async fn subscribe(url: &str, access_token: &str, subscription: &Subscription) -> Result<mpsc::Receiver<ChangeEvent>> {
    let (socket, _) = connect_async(url)
        .await
        .map_err(|e| Error::Realtime(format!("connect failed: {}", e)))?;
    let (mut sink, mut stream) = socket.split();

    let join = join_frame(subscription, access_token, 1);
    sink.send(WsMessage::Text(join.to_string()))
        .await
        .map_err(|e| Error::Realtime(format!("join failed: {}", e)))?;
    info!("Joined realtime channel {}", subscription.channel);

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let channel = subscription.channel.clone();

    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut reference = 2u64;

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    let frame = heartbeat_frame(reference);
                    reference += 1;
                    if let Err(e) = sink.send(WsMessage::Text(frame.to_string())).await {
                        warn!("Heartbeat on {} failed: {}", channel, e);
                        break;
                    }
                }
                incoming = stream.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match parse_frame(&text) {
                        Ok(Some(event)) => {
                            debug!("{} {:?} on {}", channel, event.kind, event.table);
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Realtime frame on {}: {}", channel, e),
                    },
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Realtime socket for {} failed: {}", channel, e);
                        break;
                    }
                },
                _ = tx.closed() => break,
            }
        }

        let _ = sink.close().await;
        info!("Realtime channel {} closed", channel);
    });

    Ok(rx)
}
