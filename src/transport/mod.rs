//! Boundary between the session and the Nightscout socket.
//!
//! The socket.io client in [`socketio`] turns the wire into
//! [`InboundEvent`]s and drains [`OutboundMessage`]s; nothing else in the
//! crate knows about framing.

pub mod socketio;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Connected,
    Data(DataUpdate),
    Disconnected,
    Error(String),
}

/// One `dataUpdate` push. A key that was absent on the wire stays `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataUpdate {
    pub keys: Vec<String>,
    pub sgvs: Option<Vec<Value>>,
    pub treatments: Option<Vec<Value>>,
    pub devicestatus: Option<Vec<Value>>,
}

impl DataUpdate {
    /// Lenient: a known key that is not an array is dropped with a warning.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut fields) = value else {
            log::warn!("dataUpdate payload is not an object");
            return Self::default();
        };

        let keys = fields.keys().cloned().collect();
        let mut take = |name: &str| match fields.remove(name) {
            Some(Value::Array(items)) => Some(items),
            Some(other) => {
                log::warn!("dataUpdate {} is not an array: {}", name, other);
                None
            }
            None => None,
        };

        Self {
            sgvs: take("sgvs"),
            treatments: take("treatments"),
            devicestatus: take("devicestatus"),
            keys,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Treatments,
    Devicestatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizeRequest {
    pub client: String,
    pub secret: String,
    /// Lookback in hours.
    pub history: u32,
    /// Epoch millis of the oldest record wanted.
    pub from: i64,
    pub status: bool,
}

impl AuthorizeRequest {
    pub fn new(secret: impl Into<String>, history_hours: u32, now_ms: i64) -> Self {
        Self {
            client: "openaps-ws".to_string(),
            secret: secret.into(),
            history: history_hours,
            from: now_ms - i64::from(history_hours) * 60 * 60 * 1000,
            status: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbAdd {
    pub collection: Collection,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Authorize(AuthorizeRequest),
    DbAdd(DbAdd),
}

impl OutboundMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::Authorize(_) => "authorize",
            OutboundMessage::DbAdd(_) => "dbAdd",
        }
    }

    pub fn payload(&self) -> Result<Value> {
        match self {
            OutboundMessage::Authorize(request) => serde_json::to_value(request),
            OutboundMessage::DbAdd(add) => serde_json::to_value(add),
        }
        .with_context(|| format!("Failed to encode {} payload", self.event_name()))
    }
}

/// Cloneable sending half used by the session, the triggers and the
/// handshake.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: OutboundMessage) {
        let event = message.event_name();
        if self.tx.send(message).is_err() {
            // The transport task is gone; the liveness loop ends the session.
            log::warn!("transport closed, dropping outbound {}", event);
        }
    }

    pub fn db_add(&self, collection: Collection, data: Value) {
        self.send(OutboundMessage::DbAdd(DbAdd { collection, data }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_update_keeps_absent_keys_absent() {
        let update = DataUpdate::from_value(json!({
            "sgvs": [{"mills": 1, "mgdl": 100}],
            "treatments": "oops",
            "profiles": []
        }));

        assert_eq!(update.sgvs.as_ref().map(Vec::len), Some(1));
        assert_eq!(update.treatments, None);
        assert_eq!(update.devicestatus, None);
        assert_eq!(update.keys, vec!["profiles", "sgvs", "treatments"]);
    }

    #[test]
    fn authorize_asks_for_the_lookback_window_in_millis() {
        let request = AuthorizeRequest::new("hashed-secret", 24, 1_709_287_200_000);
        let payload = OutboundMessage::Authorize(request).payload().unwrap();

        assert_eq!(
            payload,
            json!({
                "client": "openaps-ws",
                "secret": "hashed-secret",
                "history": 24,
                "from": 1_709_287_200_000_i64 - 86_400_000,
                "status": false
            })
        );
    }

    #[test]
    fn db_add_names_its_collection() {
        let message = OutboundMessage::DbAdd(DbAdd {
            collection: Collection::Devicestatus,
            data: json!({"device": "openaps://apstwo"}),
        });

        assert_eq!(message.event_name(), "dbAdd");
        assert_eq!(
            message.payload().unwrap(),
            json!({"collection": "devicestatus", "data": {"device": "openaps://apstwo"}})
        );
    }
}
