//! Minimal socket.io (Engine.IO v3) client over a websocket, enough to
//! receive `dataUpdate` pushes and emit `authorize`/`dbAdd`.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{DataUpdate, InboundEvent, OutboundMessage};

// Set to true to log socket lifecycle events
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Handshake body of an Engine.IO `open` packet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub ping_interval: Option<u64>,
    #[serde(default)]
    pub ping_timeout: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect,
    Disconnect,
    Event { name: String, args: Vec<Value> },
    Ack,
    Error(String),
}

/// `https://host` becomes `wss://host/socket.io/?EIO=3&transport=websocket`.
pub fn websocket_url(host: &str) -> Result<Url> {
    let mut url = Url::parse(host).with_context(|| format!("invalid Nightscout host {host}"))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("unsupported scheme {other} in {host}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot switch {host} to {scheme}"))?;
    url.set_path("/socket.io/");
    url.set_query(Some("EIO=3&transport=websocket"));
    Ok(url)
}

pub fn parse_engine_packet(text: &str) -> Option<EnginePacket> {
    let mut chars = text.chars();
    let kind = chars.next()?;
    let body = chars.as_str();
    match kind {
        '0' => serde_json::from_str(body).ok().map(EnginePacket::Open),
        '1' => Some(EnginePacket::Close),
        '2' => Some(EnginePacket::Ping(body.to_string())),
        '3' => Some(EnginePacket::Pong(body.to_string())),
        '4' => Some(EnginePacket::Message(body.to_string())),
        '6' => Some(EnginePacket::Noop),
        _ => None,
    }
}

/// Parses `<type>[<attachments>-][/<nsp>,][<ack id>][<json>]`.
pub fn parse_socket_packet(text: &str) -> Option<SocketPacket> {
    let mut chars = text.chars();
    let kind = chars.next()?;
    let mut rest = chars.as_str();

    if matches!(kind, '5' | '6') {
        rest = rest.split_once('-').map(|(_, tail)| tail).unwrap_or(rest);
    }
    if rest.starts_with('/') {
        rest = rest.split_once(',').map(|(_, tail)| tail).unwrap_or("");
    }
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());

    match kind {
        '0' => Some(SocketPacket::Connect),
        '1' => Some(SocketPacket::Disconnect),
        '2' | '5' => {
            let mut args: Vec<Value> = serde_json::from_str(rest).ok()?;
            if args.is_empty() {
                return None;
            }
            let name = match args.remove(0) {
                Value::String(name) => name,
                _ => return None,
            };
            Some(SocketPacket::Event { name, args })
        }
        '3' | '6' => Some(SocketPacket::Ack),
        '4' => Some(SocketPacket::Error(
            serde_json::from_str::<Value>(rest)
                .map(|value| match value {
                    Value::String(message) => message,
                    other => other.to_string(),
                })
                .unwrap_or_else(|_| rest.to_string()),
        )),
        _ => None,
    }
}

/// Engine.IO message + socket.io event frame.
pub fn encode_event(name: &str, payload: &Value) -> Result<String> {
    let frame = serde_json::to_string(&Value::Array(vec![
        Value::String(name.to_string()),
        payload.clone(),
    ]))?;
    Ok(format!("42{frame}"))
}

/// Connects and pumps frames until the socket closes or `cancel` fires.
/// Every way out is reported on `inbound`; the session decides what it means.
pub async fn run(
    url: Url,
    inbound: mpsc::Sender<InboundEvent>,
    mut outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: CancellationToken,
) {
    let terminal = match pump(&url, &inbound, &mut outbound, &cancel).await {
        Ok(None) => return,
        Ok(Some(event)) => event,
        Err(err) => {
            log_error!("socket to {} failed: {err:#}", url.host_str().unwrap_or("?"));
            InboundEvent::Error(format!("{err:#}"))
        }
    };
    let _ = inbound.send(terminal).await;
}

async fn pump(
    url: &Url,
    inbound: &mpsc::Sender<InboundEvent>,
    outbound: &mut mpsc::UnboundedReceiver<OutboundMessage>,
    cancel: &CancellationToken,
) -> Result<Option<InboundEvent>> {
    let (socket, _) = connect_async(url.as_str())
        .await
        .with_context(|| format!("Failed to connect to {}", url.host_str().unwrap_or("?")))?;
    log_info!("socket open to {}", url.host_str().unwrap_or("?"));
    let (mut sink, mut stream) = socket.split();

    let mut ping_every = DEFAULT_PING_INTERVAL;
    let mut ping = time::interval_at(Instant::now() + ping_every, ping_every);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return Ok(None);
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => return Ok(Some(InboundEvent::Disconnected)),
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(anyhow::Error::new(err).context("websocket read failed")),
                };

                match parse_engine_packet(&text) {
                    Some(EnginePacket::Open(info)) => {
                        if let Some(millis) = info.ping_interval.filter(|millis| *millis > 0) {
                            ping_every = Duration::from_millis(millis);
                            ping = time::interval_at(Instant::now() + ping_every, ping_every);
                        }
                        log::debug!("engine.io open sid={} ping every {:?}", info.sid, ping_every);
                    }
                    Some(EnginePacket::Ping(data)) => {
                        sink.send(Message::Text(format!("3{data}"))).await.context("pong failed")?;
                    }
                    Some(EnginePacket::Message(body)) => {
                        if let Some(event) = translate(&body) {
                            let terminal = matches!(event, InboundEvent::Disconnected | InboundEvent::Error(_));
                            if inbound.send(event).await.is_err() {
                                return Ok(None);
                            }
                            if terminal {
                                return Ok(None);
                            }
                        }
                    }
                    Some(EnginePacket::Close) => return Ok(Some(InboundEvent::Disconnected)),
                    Some(EnginePacket::Pong(_)) | Some(EnginePacket::Noop) => {}
                    None => log_warn!("unrecognized engine.io frame {:?}", text),
                }
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    // Session dropped its sender: nothing more to say.
                    let _ = sink.close().await;
                    return Ok(None);
                };
                let frame = encode_event(message.event_name(), &message.payload()?)?;
                sink.send(Message::Text(frame))
                    .await
                    .with_context(|| format!("Failed to emit {}", message.event_name()))?;
            }
            _ = ping.tick() => {
                sink.send(Message::Text("2".to_string())).await.context("ping failed")?;
            }
        }
    }
}

fn translate(body: &str) -> Option<InboundEvent> {
    match parse_socket_packet(body)? {
        SocketPacket::Connect => Some(InboundEvent::Connected),
        SocketPacket::Disconnect => Some(InboundEvent::Disconnected),
        SocketPacket::Error(message) => Some(InboundEvent::Error(message)),
        SocketPacket::Event { name, mut args } if name == "dataUpdate" => {
            let payload = if args.is_empty() { Value::Null } else { args.remove(0) };
            Some(InboundEvent::Data(DataUpdate::from_value(payload)))
        }
        SocketPacket::Event { name, .. } => {
            log::debug!("ignoring socket event {}", name);
            None
        }
        SocketPacket::Ack => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_maps_to_socket_endpoint() {
        assert_eq!(
            websocket_url("https://my.nightscout.example").unwrap().as_str(),
            "wss://my.nightscout.example/socket.io/?EIO=3&transport=websocket"
        );
        assert_eq!(
            websocket_url("http://localhost:1337/").unwrap().as_str(),
            "ws://localhost:1337/socket.io/?EIO=3&transport=websocket"
        );
        assert!(websocket_url("ftp://nope").is_err());
        assert!(websocket_url("not a url").is_err());
    }

    #[test]
    fn engine_open_carries_ping_interval() {
        let packet =
            parse_engine_packet(r#"0{"sid":"abc","upgrades":[],"pingInterval":25000,"pingTimeout":5000}"#);
        assert_eq!(
            packet,
            Some(EnginePacket::Open(OpenInfo {
                sid: "abc".into(),
                ping_interval: Some(25000),
                ping_timeout: Some(5000),
            }))
        );
        assert_eq!(parse_engine_packet("3probe"), Some(EnginePacket::Pong("probe".into())));
        assert_eq!(parse_engine_packet(""), None);
    }

    #[test]
    fn socket_event_with_namespace_and_ack_id() {
        assert_eq!(
            parse_socket_packet(r#"2/ns,17["dataUpdate",{"sgvs":[]}]"#),
            Some(SocketPacket::Event {
                name: "dataUpdate".into(),
                args: vec![json!({"sgvs": []})],
            })
        );
        assert_eq!(parse_socket_packet("0"), Some(SocketPacket::Connect));
        assert_eq!(
            parse_socket_packet(r#"4"unauthorized""#),
            Some(SocketPacket::Error("unauthorized".into()))
        );
        assert_eq!(parse_socket_packet("2[42]"), None);
    }

    #[test]
    fn data_update_message_becomes_inbound_data() {
        let event = translate(r#"2["dataUpdate",{"treatments":[{"eventType":"Note"}]}]"#);
        match event {
            Some(InboundEvent::Data(update)) => {
                assert_eq!(update.treatments.map(|t| t.len()), Some(1));
                assert_eq!(update.sgvs, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(translate(r#"2["announcement",{}]"#), None);
    }

    #[test]
    fn events_encode_as_message_frames() {
        let frame = encode_event("dbAdd", &json!({"collection": "treatments"})).unwrap();
        assert_eq!(frame, r#"42["dbAdd",{"collection":"treatments"}]"#);
    }
}
