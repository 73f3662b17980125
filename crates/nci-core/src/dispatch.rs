//! Client dispatch thread.
//!
//! A single consumer drains the inbound message queue fed by the transport
//! threads and the HAL, and invokes the caller-registered callbacks under
//! a re-entrant guard so a callback may trigger another callback on the
//! same thread without deadlocking.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender, bounded};
use parking_lot::{Mutex, ReentrantMutex};
use tracing::{debug, error, trace, warn};

use crate::protocol::constants::THREAD_JOIN_TIMEOUT;
use crate::transport::sync::join_with_timeout;

/// Depth of the inbound queue; producers block briefly when it is full.
const CLIENT_QUEUE_DEPTH: usize = 256;
const POST_TIMEOUT: Duration = Duration::from_secs(1);

/// Events reported to the stack callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfcEvent {
    OpenComplete,
    CloseComplete,
    PostInitComplete,
    PreDiscoverComplete,
    Error,
    HciNetworkReset,
}

/// Status accompanying an `NfcEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfcStatus {
    Ok,
    Failed,
    ErrTransport,
    ErrCmdTimeout,
    Refused,
}

impl fmt::Display for NfcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NfcStatus::Ok => write!(f, "OK"),
            NfcStatus::Failed => write!(f, "FAILED"),
            NfcStatus::ErrTransport => write!(f, "ERR_TRANSPORT"),
            NfcStatus::ErrCmdTimeout => write!(f, "ERR_CMD_TIMEOUT"),
            NfcStatus::Refused => write!(f, "REFUSED"),
        }
    }
}

/// Receives lifecycle events from the HAL.
pub trait StackCallback: Send + Sync {
    fn on_event(&self, event: NfcEvent, status: NfcStatus);
}

/// Receives inbound NCI packets (responses, notifications, data).
pub trait DataCallback: Send + Sync {
    fn on_data(&self, data: &[u8]);
}

impl<F> StackCallback for F
where
    F: Fn(NfcEvent, NfcStatus) + Send + Sync,
{
    fn on_event(&self, event: NfcEvent, status: NfcStatus) {
        self(event, status)
    }
}

impl<F> DataCallback for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn on_data(&self, data: &[u8]) {
        self(data)
    }
}

/// Messages consumed by the dispatch thread.
pub enum ClientMessage {
    OpenComplete(NfcStatus),
    CloseComplete(NfcStatus),
    PostInitComplete(NfcStatus),
    PreDiscoverComplete(NfcStatus),
    Error(NfcStatus),
    RxData(Vec<u8>),
    HciNetworkReset,
    /// Run a closure on the dispatch thread.
    Deferred(Box<dyn FnOnce() + Send>),
    /// Poison pill: the thread exits after everything queued ahead of it.
    Shutdown,
}

impl fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::OpenComplete(s) => write!(f, "OpenComplete({})", s),
            ClientMessage::CloseComplete(s) => write!(f, "CloseComplete({})", s),
            ClientMessage::PostInitComplete(s) => write!(f, "PostInitComplete({})", s),
            ClientMessage::PreDiscoverComplete(s) => write!(f, "PreDiscoverComplete({})", s),
            ClientMessage::Error(s) => write!(f, "Error({})", s),
            ClientMessage::RxData(d) => write!(f, "RxData({} bytes)", d.len()),
            ClientMessage::HciNetworkReset => write!(f, "HciNetworkReset"),
            ClientMessage::Deferred(_) => write!(f, "Deferred"),
            ClientMessage::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Producer side of the client queue.
#[derive(Clone)]
pub struct ClientQueue {
    tx: Sender<ClientMessage>,
}

impl ClientQueue {
    /// Enqueue a message. Returns false if the consumer is gone or stalled.
    pub fn post(&self, message: ClientMessage) -> bool {
        trace!(message = ?message, "Posting client message");
        match self.tx.send_timeout(message, POST_TIMEOUT) {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(m)) => {
                warn!(message = ?m, "Client queue full, message dropped");
                false
            }
            Err(SendTimeoutError::Disconnected(m)) => {
                debug!(message = ?m, "Client queue closed, message dropped");
                false
            }
        }
    }

    /// Run `f` on the dispatch thread.
    pub fn defer<F: FnOnce() + Send + 'static>(&self, f: F) -> bool {
        self.post(ClientMessage::Deferred(Box::new(f)))
    }
}

#[derive(Default)]
struct Registered {
    stack: Option<Arc<dyn StackCallback>>,
    data: Option<Arc<dyn DataCallback>>,
}

/// Caller callbacks plus the re-entrancy guard they run under.
#[derive(Default)]
pub struct CallbackTable {
    guard: ReentrantMutex<()>,
    registered: Mutex<Registered>,
}

impl CallbackTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stack: Arc<dyn StackCallback>, data: Arc<dyn DataCallback>) {
        let mut registered = self.registered.lock();
        registered.stack = Some(stack);
        registered.data = Some(data);
    }

    pub fn clear(&self) {
        *self.registered.lock() = Registered::default();
    }

    pub fn has_data_callback(&self) -> bool {
        self.registered.lock().data.is_some()
    }

    /// Invoke the stack callback, if registered.
    pub fn notify(&self, event: NfcEvent, status: NfcStatus) {
        let stack = self.registered.lock().stack.clone();
        match stack {
            Some(cb) => {
                let _guard = self.guard.lock();
                cb.on_event(event, status);
            }
            None => debug!(event = ?event, status = %status, "No stack callback, event dropped"),
        }
    }

    /// Invoke the data callback, if registered. Returns whether it ran.
    pub fn deliver_data(&self, data: &[u8]) -> bool {
        let cb = self.registered.lock().data.clone();
        match cb {
            Some(cb) => {
                let _guard = self.guard.lock();
                cb.on_data(data);
                true
            }
            None => false,
        }
    }

    /// Run `f` under the re-entrancy guard.
    pub fn guarded<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard.lock();
        f()
    }
}

/// Owner of the dispatch thread.
pub struct ClientDispatcher {
    queue: ClientQueue,
    handle: Option<JoinHandle<()>>,
}

impl ClientDispatcher {
    pub fn spawn(callbacks: Arc<CallbackTable>) -> std::io::Result<Self> {
        let (tx, rx) = bounded(CLIENT_QUEUE_DEPTH);
        let handle = thread::Builder::new()
            .name("nci-client".into())
            .spawn(move || dispatch_loop(rx, callbacks))?;
        Ok(Self {
            queue: ClientQueue { tx },
            handle: Some(handle),
        })
    }

    pub fn queue(&self) -> ClientQueue {
        self.queue.clone()
    }

    pub fn post(&self, message: ClientMessage) -> bool {
        self.queue.post(message)
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Stop the thread once every message posted so far has been handled.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.queue.post(ClientMessage::Shutdown);

        if handle.thread().id() == thread::current().id() {
            debug!("Dispatch thread stopping itself, not joining");
            return;
        }
        join_with_timeout(handle, "nci-client", THREAD_JOIN_TIMEOUT * 4);
    }
}

impl Drop for ClientDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(rx: Receiver<ClientMessage>, callbacks: Arc<CallbackTable>) {
    debug!("Client dispatch thread started");
    loop {
        let message = match rx.recv() {
            Ok(m) => m,
            Err(_) => {
                error!("Client queue disconnected");
                break;
            }
        };
        trace!(message = ?message, "Dispatching client message");
        match message {
            ClientMessage::OpenComplete(status) => callbacks.notify(NfcEvent::OpenComplete, status),
            ClientMessage::CloseComplete(status) => {
                callbacks.notify(NfcEvent::CloseComplete, status)
            }
            ClientMessage::PostInitComplete(status) => {
                callbacks.notify(NfcEvent::PostInitComplete, status)
            }
            ClientMessage::PreDiscoverComplete(status) => {
                callbacks.notify(NfcEvent::PreDiscoverComplete, status)
            }
            ClientMessage::Error(status) => callbacks.notify(NfcEvent::Error, status),
            ClientMessage::HciNetworkReset => {
                callbacks.notify(NfcEvent::HciNetworkReset, NfcStatus::Ok)
            }
            ClientMessage::RxData(data) => {
                if !callbacks.deliver_data(&data) {
                    debug!(len = data.len(), "No data callback, packet dropped");
                }
            }
            ClientMessage::Deferred(call) => callbacks.guarded(call),
            ClientMessage::Shutdown => break,
        }
    }
    debug!("Client dispatch thread exiting");
}
