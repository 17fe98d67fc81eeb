use bytes::Bytes;
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use strum_macros::Display;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::AbortHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::codec::PduFramer;
use crate::config::{Config, ConnectionBuilder};
use crate::error::{Error, ResponseError};
use crate::guard::{Guard, GuardCount, Guarded};
use crate::queue::{CommandQueue, QueuedCommand};
use crate::sockpath;
use crate::transport::BoxStream;
use crate::value::Value;

/// Lifecycle of a connection. `Broken` can be entered from any phase before `Closing`.
#[derive(Debug, Clone, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Phase {
    Unconnected,
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Broken(Error),
}

impl Phase {
    pub fn is_dead(&self) -> bool {
        matches!(self, Phase::Broken(_) | Phase::Closing | Phase::Closed)
    }
}

/// A connection to the service. Commands are sent one at a time, in the order `run` was called,
/// and each future resolves with the response to its own command.
///
/// Dropping the connection closes it.
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    id: Uuid,
    config: Config,
    runtime: Handle,
    inner: Mutex<Inner>,
    phase: watch::Sender<Phase>,
    guards: GuardCount,
}

struct Inner {
    phase: Phase,
    queue: CommandQueue,
    // Parked here between `connect` and the transport coming up.
    handshake: Option<QueuedCommand>,
    // Taken by the write task while a write is in flight.
    writer: Option<WriteHalf<BoxStream>>,
    decoding: bool,
    connecting: Option<AbortHandle>,
    reader: Option<AbortHandle>,
    write: Option<AbortHandle>,
}

impl Guarded for Shared {
    fn guard_count(&self) -> &GuardCount {
        &self.guards
    }
}

impl Connection {
    pub fn builder() -> ConnectionBuilder {
        ConnectionBuilder::new()
    }

    pub(crate) fn new(config: Config, runtime: Handle) -> Connection {
        let (phase, _) = watch::channel(Phase::Unconnected);
        let inner = Inner {
            phase: Phase::Unconnected,
            queue: CommandQueue::new(),
            handshake: None,
            writer: None,
            decoding: false,
            connecting: None,
            reader: None,
            write: None,
        };

        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            config,
            runtime,
            inner: Mutex::new(inner),
            phase,
            guards: GuardCount::new(),
        });

        Connection { shared }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// The handshake arguments used when the caller has no capabilities of its own to require.
    pub fn default_version_args() -> Value {
        Value::object([("required", Value::array(["relative_root"]))])
    }

    /// Connects to the service and negotiates capabilities. `version_args` must be an object; it
    /// is sent as the argument of the `version` command. Resolves with the service's version
    /// response.
    ///
    /// May only be called once.
    pub fn connect(&self, version_args: Value) -> ResponseFuture {
        if !version_args.is_object() {
            return ResponseFuture::failed(Error::Usage(format!(
                "version arguments must be an object, found {}",
                version_args.type_name()
            )));
        }

        let shared = &self.shared;
        let mut inner = shared.lock();
        if !matches!(inner.phase, Phase::Unconnected) {
            return ResponseFuture::failed(Error::Usage(
                "connect() may only be called once".to_string(),
            ));
        }

        let command = Value::Array(vec![Value::from("version"), version_args]);
        let (handshake, rx) = QueuedCommand::handshake(command);
        inner.handshake = Some(handshake);
        shared.set_phase(&mut inner, Phase::Connecting);

        let task = shared.runtime.spawn(connect_task(Guard::new(shared)));
        inner.connecting = Some(task.abort_handle());

        ResponseFuture::pending(rx)
    }

    /// Queues `command`. Fails without scheduling any I/O if the connection is dead or `connect`
    /// was never called.
    pub fn run(&self, command: Value) -> ResponseFuture {
        let shared = &self.shared;
        let mut inner = shared.lock();

        match &inner.phase {
            Phase::Unconnected => {
                return ResponseFuture::failed(Error::Usage(
                    "run() called before connect()".to_string(),
                ))
            }
            Phase::Closing | Phase::Closed => return ResponseFuture::failed(Error::Closed),
            Phase::Broken(err) => return ResponseFuture::failed(err.clone()),
            Phase::Connecting | Phase::Handshaking | Phase::Ready => {}
        }

        let (queued, rx) = QueuedCommand::new(command);
        inner.queue.push(queued);
        Shared::send_next(shared, &mut inner);

        ResponseFuture::pending(rx)
    }

    /// Fails every queued command with [`Error::Closed`] and shuts the transport down.
    pub fn close(&self) {
        Shared::close(&self.shared);
    }

    /// Waits until the connection is closed and every in-flight operation has finished.
    pub async fn closed(&self) {
        let mut phase = self.shared.phase.subscribe();
        let _ = phase
            .wait_for(|phase| matches!(phase, Phase::Closed))
            .await;
    }

    /// True once the connection broke or was closed. Never goes back to false.
    pub fn is_dead(&self) -> bool {
        self.shared.lock().phase.is_dead()
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase.clone()
    }

    /// Number of asynchronous operations still running against this connection.
    pub fn outstanding_ops(&self) -> usize {
        self.shared.guards.count()
    }

    /// Behaves as if the service closed the stream. Intended for tests.
    #[doc(hidden)]
    pub fn force_eof(&self) {
        Shared::read_eof(&self.shared);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        Shared::close(&self.shared);
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, inner: &mut Inner, phase: Phase) {
        debug!(connection_id = %self.id, "{} -> {}", inner.phase, phase);
        inner.phase = phase.clone();
        self.phase.send_replace(phase);
    }

    fn connect_success(shared: &Arc<Shared>, stream: BoxStream) {
        let _guard = Guard::new(shared);
        let mut inner = shared.lock();

        inner.connecting = None;
        if !matches!(inner.phase, Phase::Connecting) {
            debug!(connection_id = %shared.id, "dropping stream of a connection that is already dead");
            return;
        }

        let (reader, writer) = tokio::io::split(stream);
        inner.writer = Some(writer);
        let task = shared.runtime.spawn(read_loop(Guard::new(shared), reader));
        inner.reader = Some(task.abort_handle());

        match inner.handshake.take() {
            Some(handshake) => inner.queue.push_front(handshake),
            None => warn!(connection_id = %shared.id, "connected without a pending handshake"),
        }
        shared.set_phase(&mut inner, Phase::Handshaking);
        Shared::send_next(shared, &mut inner);
    }

    /// Starts transmitting the queue head, unless a write is in flight or the head is still
    /// waiting for its response.
    fn send_next(shared: &Arc<Shared>, inner: &mut Inner) {
        if inner.write.is_some() || !matches!(inner.phase, Phase::Handshaking | Phase::Ready) {
            return;
        }

        while let Some(head) = inner.queue.head_mut() {
            if head.is_sent() {
                return;
            }

            match shared.config.codec.encode(head.command()) {
                Ok(bytes) => {
                    let Some(writer) = inner.writer.take() else {
                        return;
                    };
                    head.mark_sent();
                    let task = shared
                        .runtime
                        .spawn(write_task(Guard::new(shared), writer, bytes));
                    inner.write = Some(task.abort_handle());
                    return;
                }
                Err(err) if head.is_handshake() => {
                    Shared::fail_locked(shared, inner, err);
                    return;
                }
                Err(err) => {
                    warn!(connection_id = %shared.id, "failed to encode command: {}", err);
                    inner.queue.resolve_head(Err(err));
                }
            }
        }
    }

    fn write_finished(
        shared: &Arc<Shared>,
        writer: WriteHalf<BoxStream>,
        result: std::io::Result<()>,
    ) {
        let _guard = Guard::new(shared);
        let failed = {
            let mut inner = shared.lock();
            inner.write = None;

            match result {
                Ok(()) if inner.phase.is_dead() => {
                    drop(writer);
                    None
                }
                Ok(()) => {
                    inner.writer = Some(writer);
                    Shared::send_next(shared, &mut inner);
                    None
                }
                Err(err) => {
                    let err = Error::from(err);
                    Shared::fail_locked(shared, &mut inner, err.clone()).then_some(err)
                }
            }
        };

        if let Some(err) = failed {
            shared.notify(Err(err));
        }
    }

    /// Routes one decoded PDU: to the command waiting for a response, or to the unsolicited
    /// callback when nothing is waiting.
    fn dispatch(shared: &Arc<Shared>, value: Value) {
        let _guard = Guard::new(shared);

        let result = match ResponseError::from_response(&value) {
            Some(err) => Err(Error::Response(err)),
            None => Ok(value),
        };

        let unsolicited = {
            let mut inner = shared.lock();
            if inner.phase.is_dead() {
                debug!(connection_id = %shared.id, "dropping PDU received after the connection died");
                return;
            }

            let unilateral = shared.config.route_unilateral && is_unilateral(&result);
            if unilateral || inner.queue.awaiting_response().is_none() {
                Some(result)
            } else {
                let handshake = inner.queue.head().is_some_and(QueuedCommand::is_handshake);
                let handshake_err = match &result {
                    Err(err) if handshake => Some(err.clone()),
                    _ => None,
                };
                if handshake && result.is_ok() {
                    info!(connection_id = %shared.id, "handshake complete");
                    shared.set_phase(&mut inner, Phase::Ready);
                }

                inner.queue.resolve_head(result);

                match handshake_err {
                    Some(err) => Shared::fail_locked(shared, &mut inner, err.clone())
                        .then_some(Err(err)),
                    None => {
                        Shared::send_next(shared, &mut inner);
                        None
                    }
                }
            }
        };

        if let Some(result) = unsolicited {
            shared.notify(result);
        }
    }

    fn read_eof(shared: &Arc<Shared>) {
        let _guard = Guard::new(shared);
        info!(connection_id = %shared.id, "connection closed by peer");
        Shared::fail(shared, Error::Eof);
    }

    fn fail(shared: &Arc<Shared>, err: Error) {
        let _guard = Guard::new(shared);
        let failed = Shared::fail_locked(shared, &mut shared.lock(), err.clone());
        if failed {
            shared.notify(Err(err));
        }
    }

    /// Moves to `Broken` and fails everything outstanding with `err`. Returns false if the
    /// connection was already dead.
    fn fail_locked(shared: &Arc<Shared>, inner: &mut Inner, err: Error) -> bool {
        if inner.phase.is_dead() {
            return false;
        }

        error!(connection_id = %shared.id, "connection failed: {}", err);
        shared.set_phase(inner, Phase::Broken(err.clone()));

        if let Some(mut handshake) = inner.handshake.take() {
            handshake.resolve(Err(err.clone()));
        }
        inner.queue.fail_all(&err);
        inner.writer = None;
        if let Some(task) = inner.connecting.take() {
            task.abort();
        }
        if let Some(task) = inner.reader.take() {
            task.abort();
        }
        if let Some(task) = inner.write.take() {
            task.abort();
        }

        true
    }

    fn close(shared: &Arc<Shared>) {
        let writer = {
            let mut inner = shared.lock();
            if matches!(inner.phase, Phase::Closing | Phase::Closed) {
                return;
            }

            info!(connection_id = %shared.id, "closing connection");
            shared.set_phase(&mut inner, Phase::Closing);

            if let Some(mut handshake) = inner.handshake.take() {
                handshake.resolve(Err(Error::Closed));
            }
            inner.queue.fail_all(&Error::Closed);
            if let Some(task) = inner.connecting.take() {
                task.abort();
            }
            if let Some(task) = inner.reader.take() {
                task.abort();
            }
            // A write stuck on a peer that stopped reading would otherwise hold its guard.
            if let Some(task) = inner.write.take() {
                task.abort();
            }
            inner.writer.take()
        };

        shared.runtime.spawn(shutdown_task(shared.clone(), writer));
    }

    fn notify(&self, result: Result<Value, Error>) {
        match &self.config.on_unsolicited {
            Some(callback) => callback(result),
            None => debug!(connection_id = %self.id, "no unsolicited callback, dropping {:?}", result),
        }
    }
}

#[instrument(name = "connect", skip_all, fields(connection_id = %guard.id))]
async fn connect_task(guard: Guard<Shared>) {
    let shared = guard.target();

    let path = match sockpath::resolve(shared.config.sock_path.as_deref()).await {
        Ok(path) => path,
        Err(err) => return Shared::fail(shared, err),
    };

    debug!("connecting to {}", path.display());
    match shared.config.connector.connect(&path).await {
        Ok(stream) => {
            info!("connected to {}", path.display());
            Shared::connect_success(shared, stream);
        }
        Err(err) => Shared::fail(shared, Error::from(err)),
    }
}

#[instrument(name = "write", skip_all, fields(connection_id = %guard.id, len = bytes.len()))]
async fn write_task(guard: Guard<Shared>, mut writer: WriteHalf<BoxStream>, bytes: Vec<u8>) {
    let result = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    }
    .await;

    Shared::write_finished(guard.target(), writer, result);
}

#[instrument(name = "read", skip_all, fields(connection_id = %guard.id))]
async fn read_loop(guard: Guard<Shared>, reader: ReadHalf<BoxStream>) {
    let shared = guard.target();
    let framer = PduFramer::new(shared.config.codec.clone(), shared.config.max_pdu_size);
    let mut pdus = FramedRead::new(reader, framer);

    // Every PDU is decoded and dispatched before the next one is looked at, which keeps
    // dispatch order equal to arrival order.
    while let Some(pdu) = pdus.next().await {
        let decoded = match pdu {
            Ok(pdu) => decode(&guard, pdu).await,
            Err(err) => Err(err),
        };

        match decoded {
            Ok(value) => Shared::dispatch(shared, value),
            // Once a PDU fails to decode, the framing of what follows cannot be trusted.
            Err(err) => return Shared::fail(shared, err),
        }
    }

    Shared::read_eof(shared);
}

async fn decode(guard: &Guard<Shared>, pdu: Bytes) -> Result<Value, Error> {
    {
        let mut inner = guard.lock();
        debug_assert!(!inner.decoding, "concurrent decodes");
        inner.decoding = true;
    }

    let result = match &guard.config.decode_executor {
        Some(executor) => {
            let guard = guard.clone();
            executor
                .spawn_blocking(move || guard.config.codec.decode(&pdu))
                .await
                .unwrap_or_else(|e| Err(Error::Decode(format!("decode task failed: {}", e))))
        }
        None => guard.config.codec.decode(&pdu),
    };

    guard.lock().decoding = false;
    result
}

async fn shutdown_task(shared: Arc<Shared>, writer: Option<WriteHalf<BoxStream>>) {
    if let Some(mut writer) = writer {
        let _guard = Guard::new(&shared);
        if let Err(err) = writer.shutdown().await {
            debug!(connection_id = %shared.id, "failed to shut the stream down: {}", err);
        }
    }

    shared.guards.drained().await;

    let mut inner = shared.lock();
    shared.set_phase(&mut inner, Phase::Closed);
    info!(connection_id = %shared.id, "connection closed");
}

fn is_unilateral(result: &Result<Value, Error>) -> bool {
    let value = match result {
        Ok(value) => value,
        Err(Error::Response(err)) => err.response(),
        Err(_) => return false,
    };

    matches!(value.get("unilateral"), Some(Value::Bool(true))) || value.get("log").is_some()
}

enum ResponseState {
    Pending(oneshot::Receiver<Result<Value, Error>>),
    Failed(Option<Error>),
}

/// Resolves with the response to a command. Failures that are known when the command is issued
/// are returned without waiting for any I/O.
pub struct ResponseFuture {
    state: ResponseState,
}

impl ResponseFuture {
    fn pending(rx: oneshot::Receiver<Result<Value, Error>>) -> ResponseFuture {
        ResponseFuture {
            state: ResponseState::Pending(rx),
        }
    }

    fn failed(err: Error) -> ResponseFuture {
        ResponseFuture {
            state: ResponseState::Failed(Some(err)),
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ResponseState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|result| result.unwrap_or(Err(Error::Closed))),
            ResponseState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(Error::Closed))),
        }
    }
}
