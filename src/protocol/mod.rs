//! Replication wire protocol.
//!
//! Three message shapes travel over one persistent bidirectional connection:
//!
//! - Request: `{rx, to: <verb>, of: <params>}`, a mirror-originated verb
//!   with `rx` strictly increasing per connection.
//! - Response: `{rx, to: "ok"|"error", of: <result|message>}`, correlated
//!   by `rx`.
//! - Notification: `{to: "open"|"change"|"close"|"ping"|"pong", of?}`, an
//!   authority-originated stream event (or the heartbeat pair).
//!
//! Framing is newline-delimited JSON over any async byte stream: TCP in the
//! server binary, an in-memory duplex in tests.

pub mod authority;
pub mod mirror;

use crate::change::{ChangeRecord, Patch};
use crate::engine::VerbOutcome;
use crate::error::{Result, TreeError};
use crate::node::NodeEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Heartbeat interval on the authority side.
pub const HEARTBEAT_INTERVAL_MS: u64 = 15_000;
/// How long a mirror waits on a pending request before rejecting it.
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

/// A verb forwarded from a mirror to the authority.
#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Add { path: String, data: Option<Value> },
    Copy { from: String, to: String },
    Move { from: String, to: String },
    Remove { path: String },
    Write { path: String, data: Value, expect: Option<i64> },
    Patch { path: String, patch: Patch },
    Load { path: String },
}

impl Verb {
    pub fn name(&self) -> &'static str {
        match self {
            Verb::Add { .. } => "add",
            Verb::Copy { .. } => "copy",
            Verb::Move { .. } => "move",
            Verb::Remove { .. } => "remove",
            Verb::Write { .. } => "write",
            Verb::Patch { .. } => "patch",
            Verb::Load { .. } => "load",
        }
    }
}

/// The full-snapshot payload sent when a mirror connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    /// Every current entry, in store insertion order.
    pub added: Vec<NodeEntry>,
    pub tx: u64,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub rx: u64,
    pub verb: Verb,
}

#[derive(Debug, Clone)]
pub struct Response {
    pub rx: u64,
    pub result: std::result::Result<Value, String>,
}

#[derive(Debug, Clone)]
pub enum Notification {
    Open(Snapshot),
    Change(ChangeRecord),
    Close,
    Ping,
    Pong,
}

/// Any wire message.
#[derive(Debug, Clone)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

/// Verb result as carried in an `ok` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOutcome {
    pub entry: NodeEntry,
    pub tx: u64,
}

impl From<VerbOutcome> for WireOutcome {
    fn from(outcome: VerbOutcome) -> WireOutcome {
        WireOutcome {
            entry: outcome.entry,
            tx: outcome.tx,
        }
    }
}

impl From<WireOutcome> for VerbOutcome {
    fn from(wire: WireOutcome) -> VerbOutcome {
        VerbOutcome {
            entry: wire.entry,
            tx: wire.tx,
        }
    }
}

// Raw transfer shape shared by all three message kinds.
#[derive(Debug, Serialize, Deserialize)]
struct RawMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    rx: Option<u64>,
    to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    of: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct FromToParams {
    from: String,
    to: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddParams {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WriteParams {
    path: String,
    data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expect: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PatchParams {
    path: String,
    patch: Patch,
}

impl Message {
    fn to_raw(&self) -> Result<RawMessage> {
        Ok(match self {
            Message::Request(req) => {
                let of = match &req.verb {
                    Verb::Add { path, data } => serde_json::to_value(AddParams {
                        path: path.clone(),
                        data: data.clone(),
                    })?,
                    Verb::Copy { from, to } | Verb::Move { from, to } => {
                        serde_json::to_value(FromToParams {
                            from: from.clone(),
                            to: to.clone(),
                        })?
                    }
                    Verb::Remove { path } | Verb::Load { path } => {
                        serde_json::to_value(PathParams { path: path.clone() })?
                    }
                    Verb::Write { path, data, expect } => serde_json::to_value(WriteParams {
                        path: path.clone(),
                        data: data.clone(),
                        expect: *expect,
                    })?,
                    Verb::Patch { path, patch } => serde_json::to_value(PatchParams {
                        path: path.clone(),
                        patch: patch.clone(),
                    })?,
                };
                RawMessage {
                    rx: Some(req.rx),
                    to: req.verb.name().to_string(),
                    of: Some(of),
                }
            }
            Message::Response(resp) => match &resp.result {
                Ok(value) => RawMessage {
                    rx: Some(resp.rx),
                    to: "ok".to_string(),
                    of: Some(value.clone()),
                },
                Err(message) => RawMessage {
                    rx: Some(resp.rx),
                    to: "error".to_string(),
                    of: Some(Value::String(message.clone())),
                },
            },
            Message::Notification(notif) => match notif {
                Notification::Open(snapshot) => RawMessage {
                    rx: None,
                    to: "open".to_string(),
                    of: Some(serde_json::to_value(snapshot)?),
                },
                Notification::Change(record) => RawMessage {
                    rx: None,
                    to: "change".to_string(),
                    of: Some(serde_json::to_value(record)?),
                },
                Notification::Close => RawMessage {
                    rx: None,
                    to: "close".to_string(),
                    of: None,
                },
                Notification::Ping => RawMessage {
                    rx: None,
                    to: "ping".to_string(),
                    of: None,
                },
                Notification::Pong => RawMessage {
                    rx: None,
                    to: "pong".to_string(),
                    of: None,
                },
            },
        })
    }

    fn from_raw(raw: RawMessage) -> Result<Message> {
        let RawMessage { rx, to, of } = raw;
        if let Some(rx) = rx {
            // A correlated message: response statuses first, otherwise a verb.
            return Ok(match to.as_str() {
                "ok" => Message::Response(Response {
                    rx,
                    result: Ok(of.unwrap_or(Value::Null)),
                }),
                "error" => {
                    let message = match of {
                        Some(Value::String(s)) => s,
                        Some(other) => other.to_string(),
                        None => "unknown remote error".to_string(),
                    };
                    Message::Response(Response {
                        rx,
                        result: Err(message),
                    })
                }
                verb => Message::Request(Request {
                    rx,
                    verb: parse_verb(verb, of)?,
                }),
            });
        }
        Ok(Message::Notification(match to.as_str() {
            "open" => Notification::Open(decode(of, "open")?),
            "change" => Notification::Change(decode(of, "change")?),
            "close" => Notification::Close,
            "ping" => Notification::Ping,
            "pong" => Notification::Pong,
            other => {
                return Err(TreeError::Protocol(format!(
                    "unknown notification '{}'",
                    other
                )))
            }
        }))
    }
}

fn decode<T: serde::de::DeserializeOwned>(of: Option<Value>, what: &str) -> Result<T> {
    let value = of.ok_or_else(|| TreeError::Protocol(format!("{} without payload", what)))?;
    serde_json::from_value(value).map_err(TreeError::Codec)
}

fn parse_verb(name: &str, of: Option<Value>) -> Result<Verb> {
    Ok(match name {
        "add" => {
            let p: AddParams = decode(of, "add")?;
            Verb::Add {
                path: p.path,
                data: p.data,
            }
        }
        "copy" => {
            let p: FromToParams = decode(of, "copy")?;
            Verb::Copy {
                from: p.from,
                to: p.to,
            }
        }
        "move" => {
            let p: FromToParams = decode(of, "move")?;
            Verb::Move {
                from: p.from,
                to: p.to,
            }
        }
        "remove" => {
            let p: PathParams = decode(of, "remove")?;
            Verb::Remove { path: p.path }
        }
        "write" => {
            let p: WriteParams = decode(of, "write")?;
            Verb::Write {
                path: p.path,
                data: p.data,
                expect: p.expect,
            }
        }
        "patch" => {
            let p: PatchParams = decode(of, "patch")?;
            Verb::Patch {
                path: p.path,
                patch: p.patch,
            }
        }
        "load" => {
            let p: PathParams = decode(of, "load")?;
            Verb::Load { path: p.path }
        }
        other => return Err(TreeError::Protocol(format!("unknown verb '{}'", other))),
    })
}

/// Write one newline-framed message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(&message.to_raw()?)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one newline-framed message; `None` at clean EOF.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawMessage = serde_json::from_str(line.trim())?;
        return Message::from_raw(raw).map(Some);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_encodes_verb_in_to() {
        let msg = Message::Request(Request {
            rx: 3,
            verb: Verb::Add {
                path: "a/b.json".to_string(),
                data: Some(json!({"x": 1})),
            },
        });
        let raw = serde_json::to_value(msg.to_raw().unwrap()).unwrap();
        assert_eq!(raw["rx"], 3);
        assert_eq!(raw["to"], "add");
        assert_eq!(raw["of"]["path"], "a/b.json");
    }

    #[test]
    fn response_classification_beats_verb_names() {
        let raw = RawMessage {
            rx: Some(9),
            to: "error".to_string(),
            of: Some(json!("not found: x")),
        };
        match Message::from_raw(raw).unwrap() {
            Message::Response(resp) => {
                assert_eq!(resp.rx, 9);
                assert_eq!(resp.result.unwrap_err(), "not found: x");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn notification_without_rx() {
        let raw = RawMessage {
            rx: None,
            to: "ping".to_string(),
            of: None,
        };
        assert!(matches!(
            Message::from_raw(raw).unwrap(),
            Message::Notification(Notification::Ping)
        ));
    }

    #[test]
    fn unknown_verb_is_protocol_error() {
        let raw = RawMessage {
            rx: Some(1),
            to: "obliterate".to_string(),
            of: Some(json!({"path": "x"})),
        };
        assert!(matches!(
            Message::from_raw(raw),
            Err(TreeError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn framing_round_trips_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, mut client_write) = tokio::io::split(client);

        let msg = Message::Notification(Notification::Open(Snapshot {
            added: vec![],
            tx: 12,
        }));
        write_message(&mut client_write, &msg).await.unwrap();

        let mut reader = tokio::io::BufReader::new(server_read);
        let received = read_message(&mut reader).await.unwrap().unwrap();
        match received {
            Message::Notification(Notification::Open(snapshot)) => assert_eq!(snapshot.tx, 12),
            other => panic!("expected open, got {:?}", other),
        }
    }
}
