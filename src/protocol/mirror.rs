//! Mirror-side replication driver.
//!
//! A remote-proxy [`Driver`]: every verb becomes a correlated request to the
//! authority, and the local store is maintained passively from the
//! authority's notification stream. The mutation produced by a request is
//! never applied from its response: it arrives through the ordinary
//! `change` broadcast like on every other mirror, and the response only
//! resolves the caller's pending future.
//!
//! Connection states: `connecting -> awaiting-snapshot -> live -> closed`.

use super::{
    read_message, write_message, Message, Notification, Request, Verb, WireOutcome,
    REQUEST_TIMEOUT_MS,
};
use crate::change::Patch;
use crate::driver::{Driver, DriverContext};
use crate::engine::{ApplyHandle, BuildNode, MutationEngine, VerbOutcome};
use crate::error::{Result, TreeError};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    AwaitingSnapshot,
    Live,
    Closed,
}

/// Any async byte stream usable as the mirror's connection.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Conn for T {}

type RemoteResult = std::result::Result<Value, String>;

/// Request/response correlation state. One lock covers all three maps so a
/// response can never land between a waiter's orphan check and its pending
/// registration.
#[derive(Default)]
struct Correlation {
    pending: HashMap<u64, oneshot::Sender<RemoteResult>>,
    /// Responses that arrived with no matching pending request, kept so a
    /// later wait on the same request number can claim them.
    orphans: HashMap<u64, RemoteResult>,
    /// Request numbers whose waiter already timed out; a late response is
    /// dropped instead of stashed.
    abandoned: HashSet<u64>,
}

struct MirrorInner {
    engine: Arc<MutationEngine>,
    handle: ApplyHandle,
    outbox: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    correlation: Mutex<Correlation>,
    next_rx: AtomicU64,
    state: RwLock<ConnState>,
    ready: Mutex<Option<oneshot::Receiver<()>>>,
    timeout: Duration,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// Driver that proxies all verbs to a remote authority.
pub struct MirrorDriver {
    inner: Arc<MirrorInner>,
    /// Connection to adopt at `open()`; either injected pre-connected or
    /// dialed from `remote`.
    io: Mutex<Option<Box<dyn Conn>>>,
    remote: Option<String>,
}

impl MirrorDriver {
    /// Build from the factory context; `open()` dials `config.listen`.
    pub fn new(context: DriverContext) -> Result<MirrorDriver> {
        let remote = context
            .config
            .listen
            .clone()
            .ok_or_else(|| TreeError::Config("mirror driver needs a remote address".to_string()))?;
        Ok(MirrorDriver {
            inner: MirrorInner::new(context.engine, context.handle),
            io: Mutex::new(None),
            remote: Some(remote),
        })
    }

    /// Build around an already-connected byte stream (tests, custom dials).
    pub fn attached<IO: Conn>(
        engine: Arc<MutationEngine>,
        handle: ApplyHandle,
        io: IO,
    ) -> MirrorDriver {
        MirrorDriver {
            inner: MirrorInner::new(engine, handle),
            io: Mutex::new(Some(Box::new(io))),
            remote: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> MirrorDriver {
        // Only meaningful before open().
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.timeout = timeout;
        }
        self
    }

    pub fn state(&self) -> ConnState {
        *self.inner.state.read()
    }

    async fn request(&self, verb: Verb) -> Result<Value> {
        let rx = self.inner.send_request(verb)?;
        self.inner.wait_response(rx).await
    }

    async fn request_outcome(&self, verb: Verb) -> Result<VerbOutcome> {
        let value = self.request(verb).await?;
        let wire: WireOutcome = serde_json::from_value(value)?;
        Ok(wire.into())
    }
}

#[async_trait]
impl Driver for MirrorDriver {
    /// Connect (when not pre-connected), then block until the snapshot has
    /// been bulk-loaded into the local store.
    async fn open(&self) -> Result<u64> {
        let io = self.io.lock().take();
        let io: Box<dyn Conn> = match io {
            Some(io) => io,
            None => {
                let addr = self
                    .remote
                    .as_ref()
                    .ok_or_else(|| TreeError::Config("no connection and no remote".to_string()))?;
                debug!(%addr, "mirror dialing authority");
                Box::new(tokio::net::TcpStream::connect(addr).await?)
            }
        };
        let ready = self.inner.spawn_io(io);
        match tokio::time::timeout(self.inner.timeout, ready).await {
            Ok(Ok(())) => {
                info!(tx = self.inner.engine.tx(), "mirror live");
                Ok(self.inner.engine.tx())
            }
            Ok(Err(_)) => Err(TreeError::Closed),
            Err(_) => Err(TreeError::Timeout(0)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown();
        Ok(())
    }

    async fn add(&self, path: &str, data: Option<Value>) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Add {
            path: path.to_string(),
            data,
        })
        .await
    }

    async fn copy(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Copy {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Move {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Remove {
            path: path.to_string(),
        })
        .await
    }

    async fn write(&self, path: &str, data: Value, expect: Option<i64>) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Write {
            path: path.to_string(),
            data,
            expect,
        })
        .await
    }

    async fn patch(&self, path: &str, patch: Patch) -> Result<VerbOutcome> {
        self.request_outcome(Verb::Patch {
            path: path.to_string(),
            patch,
        })
        .await
    }

    /// Fetch a payload from the authority and cache it locally.
    async fn load(&self, path: &str) -> Result<Value> {
        if let Some(value) = self.inner.engine.with_store(|store| {
            store.resolve(path).and_then(|n| n.data().cloned())
        }) {
            return Ok(value);
        }
        let value = self
            .request(Verb::Load {
                path: path.to_string(),
            })
            .await?;
        let id = self
            .inner
            .engine
            .with_store(|store| store.resolve_id(path));
        if let Some(id) = id {
            self.inner.handle.set_file_data(&id, Some(value.clone()))?;
        }
        Ok(value)
    }
}

/// Build a mirror repository over an already-connected byte stream.
///
/// The returned repository behaves like any other: `open()` blocks until the
/// snapshot is loaded, verbs round-trip through the authority.
pub fn mirror_repository<IO: Conn>(
    io: IO,
    types: crate::registry::FileTypeRegistry,
) -> crate::repo::Repository {
    let engine = MutationEngine::new(Arc::new(crate::types::UuidIdGen));
    let driver = Arc::new(MirrorDriver::attached(
        Arc::clone(&engine),
        engine.internal_handle(),
        io,
    ));
    crate::repo::Repository::with_driver(engine, driver, types)
}

impl MirrorInner {
    fn new(engine: Arc<MutationEngine>, handle: ApplyHandle) -> Arc<MirrorInner> {
        Arc::new(MirrorInner {
            engine,
            handle,
            outbox: Mutex::new(None),
            correlation: Mutex::new(Correlation::default()),
            next_rx: AtomicU64::new(1),
            state: RwLock::new(ConnState::Connecting),
            ready: Mutex::new(None),
            timeout: Duration::from_millis(REQUEST_TIMEOUT_MS),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the writer/reader tasks over `io`; the returned receiver fires
    /// once the snapshot is loaded.
    fn spawn_io(self: &Arc<Self>, io: Box<dyn Conn>) -> oneshot::Receiver<()> {
        let (ready_tx, ready_rx) = oneshot::channel();
        *self.state.write() = ConnState::AwaitingSnapshot;

        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
        *self.outbox.lock() = Some(outbox_tx);

        let (read_half, write_half) = tokio::io::split(io);

        let writer = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(message) = outbox_rx.recv().await {
                if let Err(err) = write_message(&mut write_half, &message).await {
                    debug!(error = %err, "mirror write failed");
                    break;
                }
            }
        });

        let reader = {
            let inner = Arc::clone(self);
            tokio::spawn(async move {
                let mut reader = BufReader::new(read_half);
                let mut ready_tx = Some(ready_tx);
                loop {
                    match read_message(&mut reader).await {
                        Ok(Some(message)) => {
                            if !inner.handle_inbound(message, &mut ready_tx) {
                                break;
                            }
                        }
                        Ok(None) => {
                            debug!("authority closed the connection");
                            break;
                        }
                        Err(err) => {
                            warn!(error = %err, "mirror read failed");
                            break;
                        }
                    }
                }
                inner.connection_lost();
            })
        };

        self.tasks.lock().extend([writer, reader]);
        ready_rx
    }

    /// Returns `false` when the connection should wind down.
    fn handle_inbound(
        &self,
        message: Message,
        ready_tx: &mut Option<oneshot::Sender<()>>,
    ) -> bool {
        match message {
            Message::Notification(Notification::Open(snapshot)) => {
                let count = snapshot.added.len();
                let nodes = snapshot
                    .added
                    .into_iter()
                    .map(|entry| BuildNode { entry, data: None })
                    .collect();
                if let Err(err) = self.handle.build(nodes, snapshot.tx) {
                    warn!(error = %err, "snapshot load failed");
                    return false;
                }
                *self.state.write() = ConnState::Live;
                debug!(count, tx = snapshot.tx, "snapshot loaded");
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(());
                }
                true
            }
            Message::Notification(Notification::Change(record)) => {
                if let Err(err) = self.handle.sync(record) {
                    warn!(error = %err, "sync failed");
                }
                true
            }
            Message::Notification(Notification::Ping) => {
                self.send(Message::Notification(Notification::Pong));
                true
            }
            Message::Notification(Notification::Close) => {
                debug!("authority sent close");
                false
            }
            Message::Notification(Notification::Pong) => true,
            Message::Response(response) => {
                let mut corr = self.correlation.lock();
                if corr.abandoned.remove(&response.rx) {
                    debug!(rx = response.rx, "response after timeout; dropping");
                } else if let Some(tx) = corr.pending.remove(&response.rx) {
                    let _ = tx.send(response.result);
                } else {
                    // Tolerates reordering between send and await: the
                    // caller claims this when it waits on the number.
                    corr.orphans.insert(response.rx, response.result);
                }
                true
            }
            Message::Request(request) => {
                warn!(rx = request.rx, "mirror received a request; ignoring");
                true
            }
        }
    }

    fn send(&self, message: Message) {
        let outbox = self.outbox.lock();
        if let Some(tx) = outbox.as_ref() {
            let _ = tx.send(message);
        }
    }

    fn send_request(&self, verb: Verb) -> Result<u64> {
        if *self.state.read() != ConnState::Live {
            return Err(TreeError::Closed);
        }
        let rx = self.next_rx.fetch_add(1, Ordering::SeqCst);
        let outbox = self.outbox.lock();
        let tx = outbox.as_ref().ok_or(TreeError::Closed)?;
        tx.send(Message::Request(Request { rx, verb }))
            .map_err(|_| TreeError::Closed)?;
        Ok(rx)
    }

    async fn wait_response(&self, rx: u64) -> Result<Value> {
        let receiver = {
            let mut corr = self.correlation.lock();
            // The response may already have arrived and been stashed.
            if let Some(result) = corr.orphans.remove(&rx) {
                return result.map_err(TreeError::Remote);
            }
            let (tx, receiver) = oneshot::channel();
            corr.pending.insert(rx, tx);
            receiver
        };
        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(result)) => result.map_err(TreeError::Remote),
            Ok(Err(_)) => Err(TreeError::Closed),
            Err(_) => {
                let mut corr = self.correlation.lock();
                corr.pending.remove(&rx);
                // The response may have landed while the timeout fired;
                // either way nothing will wait on this number again.
                corr.orphans.remove(&rx);
                corr.abandoned.insert(rx);
                debug!(rx, "pending request timed out");
                Err(TreeError::Timeout(rx))
            }
        }
    }

    /// Reader ended: fail pending requests and mark the connection closed.
    fn connection_lost(&self) {
        *self.state.write() = ConnState::Closed;
        self.outbox.lock().take();
        *self.correlation.lock() = Correlation::default();
    }

    fn shutdown(&self) {
        self.send(Message::Notification(Notification::Close));
        *self.state.write() = ConnState::Closed;
        self.outbox.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.correlation.lock() = Correlation::default();
        self.handle.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Response;
    use serde_json::json;

    fn inner_with_timeout(timeout: Duration) -> Arc<MirrorInner> {
        let engine = MutationEngine::for_tests();
        let mut inner = MirrorInner::new(Arc::clone(&engine), engine.internal_handle());
        Arc::get_mut(&mut inner).unwrap().timeout = timeout;
        inner
    }

    fn response(rx: u64, value: Value) -> Message {
        Message::Response(Response {
            rx,
            result: Ok(value),
        })
    }

    #[tokio::test]
    async fn response_arriving_before_wait_is_claimed() {
        let inner = inner_with_timeout(Duration::from_secs(5));
        // The reader task can deliver a response before the requester starts
        // waiting on its number.
        inner.handle_inbound(response(7, json!({"ok": 1})), &mut None);

        let value = inner.wait_response(7).await.unwrap();
        assert_eq!(value, json!({"ok": 1}));
        let corr = inner.correlation.lock();
        assert!(corr.orphans.is_empty());
        assert!(corr.pending.is_empty());
    }

    #[tokio::test]
    async fn timed_out_request_rejects_and_drops_the_late_response() {
        let inner = inner_with_timeout(Duration::from_millis(5));
        let err = inner.wait_response(3).await.unwrap_err();
        assert!(matches!(err, TreeError::Timeout(3)));

        // A response landing after the timeout must not accumulate.
        inner.handle_inbound(response(3, json!(null)), &mut None);
        let corr = inner.correlation.lock();
        assert!(corr.orphans.is_empty());
        assert!(corr.pending.is_empty());
        assert!(corr.abandoned.is_empty());
    }

    #[tokio::test]
    async fn each_waiter_claims_its_own_number() {
        let inner = inner_with_timeout(Duration::from_secs(5));
        inner.handle_inbound(response(2, json!("second")), &mut None);
        inner.handle_inbound(response(1, json!("first")), &mut None);

        assert_eq!(inner.wait_response(1).await.unwrap(), json!("first"));
        assert_eq!(inner.wait_response(2).await.unwrap(), json!("second"));
    }
}
