//! Authority-side replication service.
//!
//! Owns the driver-backed node store and keeps any number of mirrors
//! consistent: a full snapshot on connect, every applied change broadcast to
//! all live sessions (including the originator of the request that produced
//! it), correlated responses for mirror verbs, and a ping/pong heartbeat
//! that drops unresponsive connections. Sessions live in an explicit
//! registry with insert/remove tied to connect/disconnect.

use super::{
    read_message, write_message, Message, Notification, Request, Response, Snapshot, Verb,
    WireOutcome, HEARTBEAT_INTERVAL_MS,
};
use crate::driver::Driver;
use crate::engine::MutationEngine;
use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct Session {
    outbox: mpsc::UnboundedSender<Message>,
    awaiting_pong: Arc<AtomicBool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

struct AuthorityInner {
    engine: Arc<MutationEngine>,
    driver: Arc<dyn Driver>,
    sessions: RwLock<HashMap<u64, Session>>,
    next_session: AtomicU64,
    heartbeat: Duration,
    service_tasks: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

/// The authority service. Cheap to clone; all clones share one session
/// registry and one store.
#[derive(Clone)]
pub struct Authority {
    inner: Arc<AuthorityInner>,
}

impl Authority {
    pub fn new(engine: Arc<MutationEngine>, driver: Arc<dyn Driver>) -> Authority {
        Authority {
            inner: Arc::new(AuthorityInner {
                engine,
                driver,
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                heartbeat: Duration::from_millis(HEARTBEAT_INTERVAL_MS),
                service_tasks: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn with_heartbeat(self, interval: Duration) -> Authority {
        // Only safe before start(); the service tasks capture the value.
        let inner = Arc::try_unwrap(self.inner).unwrap_or_else(|arc| AuthorityInner {
            engine: Arc::clone(&arc.engine),
            driver: Arc::clone(&arc.driver),
            sessions: RwLock::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            heartbeat: arc.heartbeat,
            service_tasks: RwLock::new(Vec::new()),
        });
        Authority {
            inner: Arc::new(AuthorityInner {
                heartbeat: interval,
                ..inner
            }),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Spawn the change fan-out and heartbeat tasks.
    pub fn start(&self) {
        let fanout = {
            let inner = Arc::clone(&self.inner);
            let mut changes = inner.engine.subscribe();
            tokio::spawn(async move {
                loop {
                    match changes.recv().await {
                        Ok(record) => {
                            let sessions = inner.sessions.read();
                            for (id, session) in sessions.iter() {
                                let msg =
                                    Message::Notification(Notification::Change((*record).clone()));
                                if session.outbox.send(msg).is_err() {
                                    debug!(session = id, "outbox closed during broadcast");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "change fan-out lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let heartbeat = {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(inner.heartbeat);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // First tick fires immediately; skip it so connections get a
                // full interval before their first ping.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    let stale: Vec<u64> = {
                        let sessions = inner.sessions.read();
                        sessions
                            .iter()
                            .filter(|(_, s)| s.awaiting_pong.load(Ordering::SeqCst))
                            .map(|(id, _)| *id)
                            .collect()
                    };
                    for id in stale {
                        warn!(session = id, "missed heartbeat; disconnecting");
                        AuthorityInner::disconnect(&inner, id);
                    }
                    let sessions = inner.sessions.read();
                    for session in sessions.values() {
                        session.awaiting_pong.store(true, Ordering::SeqCst);
                        let _ = session
                            .outbox
                            .send(Message::Notification(Notification::Ping));
                    }
                }
            })
        };

        self.inner.service_tasks.write().extend([fanout, heartbeat]);
    }

    /// Accept mirror connections forever.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "authority listening");
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "mirror connecting");
            self.attach(stream);
        }
    }

    /// Attach one connected mirror over any byte stream.
    pub fn attach<IO>(&self, io: IO) -> u64
    where
        IO: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let session_id = inner.next_session.fetch_add(1, Ordering::SeqCst);
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        let awaiting_pong = Arc::new(AtomicBool::new(false));

        // Register and enqueue the snapshot under one registry lock: the
        // fan-out task also takes it, so no change can slip into the outbox
        // ahead of `open` or be missed between snapshot and registration.
        {
            let mut sessions = inner.sessions.write();
            sessions.insert(
                session_id,
                Session {
                    outbox: outbox_tx.clone(),
                    awaiting_pong: Arc::clone(&awaiting_pong),
                    tasks: Vec::new(),
                },
            );
            let snapshot = Snapshot {
                added: inner.engine.with_store(|store| store.entries()),
                tx: inner.engine.tx(),
            };
            let _ = outbox_tx.send(Message::Notification(Notification::Open(snapshot)));
        }

        let (read_half, write_half) = tokio::io::split(io);

        let writer = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(message) = outbox_rx.recv().await {
                if let Err(err) = write_message(&mut write_half, &message).await {
                    debug!(session = session_id, error = %err, "write failed; stopping writer");
                    break;
                }
            }
        });

        let reader = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                loop {
                    match read_message(&mut reader).await {
                        Ok(Some(Message::Request(request))) => {
                            let response =
                                AuthorityInner::execute(&inner, session_id, request).await;
                            let delivered = {
                                let sessions = inner.sessions.read();
                                sessions
                                    .get(&session_id)
                                    .map(|s| s.outbox.send(Message::Response(response)).is_ok())
                                    .unwrap_or(false)
                            };
                            if !delivered {
                                break;
                            }
                        }
                        Ok(Some(Message::Notification(Notification::Pong))) => {
                            awaiting_pong.store(false, Ordering::SeqCst);
                        }
                        Ok(Some(Message::Notification(Notification::Close))) | Ok(None) => {
                            debug!(session = session_id, "mirror disconnected");
                            break;
                        }
                        Ok(Some(other)) => {
                            warn!(session = session_id, message = ?other, "unexpected message");
                        }
                        Err(err) => {
                            warn!(session = session_id, error = %err, "read failed");
                            break;
                        }
                    }
                }
                AuthorityInner::disconnect(&inner, session_id);
            })
        };

        if let Some(session) = inner.sessions.write().get_mut(&session_id) {
            session.tasks.push(writer);
            session.tasks.push(reader);
        }
        info!(session = session_id, "mirror session opened");
        session_id
    }

    /// Send `close` to every mirror and stop service tasks.
    pub fn shutdown(&self) {
        let mut sessions = self.inner.sessions.write();
        for (id, session) in sessions.drain() {
            let _ = session
                .outbox
                .send(Message::Notification(Notification::Close));
            for task in session.tasks {
                task.abort();
            }
            debug!(session = id, "session closed on shutdown");
        }
        for task in self.inner.service_tasks.write().drain(..) {
            task.abort();
        }
    }
}

impl AuthorityInner {
    /// Execute a mirror verb against the single authoritative store. The
    /// mutation reaches the requester through the ordinary broadcast; the
    /// response only resolves its pending promise.
    async fn execute(inner: &Arc<AuthorityInner>, session_id: u64, request: Request) -> Response {
        let verb_name = request.verb.name();
        debug!(session = session_id, rx = request.rx, verb = verb_name, "executing mirror verb");
        let result = match request.verb {
            Verb::Add { path, data } => inner
                .driver
                .add(&path, data)
                .await
                .and_then(outcome_to_value),
            Verb::Copy { from, to } => inner
                .driver
                .copy(&from, &to)
                .await
                .and_then(outcome_to_value),
            Verb::Move { from, to } => inner
                .driver
                .rename(&from, &to)
                .await
                .and_then(outcome_to_value),
            Verb::Remove { path } => inner
                .driver
                .remove(&path)
                .await
                .and_then(outcome_to_value),
            Verb::Write { path, data, expect } => inner
                .driver
                .write(&path, data, expect)
                .await
                .and_then(outcome_to_value),
            Verb::Patch { path, patch } => inner
                .driver
                .patch(&path, patch)
                .await
                .and_then(outcome_to_value),
            Verb::Load { path } => inner.driver.load(&path).await,
        };
        match result {
            Ok(value) => Response {
                rx: request.rx,
                result: Ok(value),
            },
            Err(err) => {
                debug!(session = session_id, rx = request.rx, verb = verb_name, error = %err, "mirror verb failed");
                Response {
                    rx: request.rx,
                    result: Err(err.to_string()),
                }
            }
        }
    }

    fn disconnect(inner: &Arc<AuthorityInner>, session_id: u64) {
        if let Some(session) = inner.sessions.write().remove(&session_id) {
            for task in session.tasks {
                task.abort();
            }
            info!(session = session_id, "mirror session removed");
        }
    }
}

fn outcome_to_value(outcome: crate::engine::VerbOutcome) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(WireOutcome::from(outcome))?)
}
