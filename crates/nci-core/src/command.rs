//! Command/response dispatch on top of the transport.
//!
//! `CommandDispatcher::write` pushes one frame through the transport with
//! bounded retries, and `exchange` additionally blocks until the matching
//! response (and optionally a follow-up notification) is routed back by the
//! read path. Only one exchange is ever outstanding, so a response is matched
//! by position alone.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, instrument, trace, warn};

use crate::channel::{FrameChannel, ResetMode};
use crate::dispatch::{CallbackTable, ClientMessage, ClientQueue};
use crate::events::{HalEvent, HalObserver};
use crate::hal::{HalStatus, StatusCell};
use crate::protocol::constants::*;
use crate::protocol::{FrameError, MessageType, NciFrame, hex, is_command};
use crate::transport::{TransferStatus, Transport, TransportError};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Write failed after {attempts} attempts")]
    WriteFailed { attempts: u32 },

    #[error("No {what} within {timeout_ms}ms")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("Command rejected with status 0x{status:02X}")]
    Rejected { status: u8, response: Vec<u8> },

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),
}

impl DispatchError {
    /// Status byte of a rejected command.
    pub fn status(&self) -> Option<u8> {
        match self {
            DispatchError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Deadlines applied by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchTimeouts {
    pub write_window_ms: u64,
    pub response_ms: u64,
    pub notification_ms: u64,
    pub write_complete_ms: u64,
}

impl Default for DispatchTimeouts {
    fn default() -> Self {
        Self {
            write_window_ms: 2000,
            response_ms: 2500,
            notification_ms: 2500,
            write_complete_ms: 1000,
        }
    }
}

impl DispatchTimeouts {
    pub fn write_window(&self) -> Duration {
        Duration::from_millis(self.write_window_ms)
    }

    pub fn response(&self) -> Duration {
        Duration::from_millis(self.response_ms)
    }

    pub fn notification(&self) -> Duration {
        Duration::from_millis(self.notification_ms)
    }

    pub fn write_complete(&self) -> Duration {
        Duration::from_millis(self.write_complete_ms)
    }
}

/// Binary token shared with a sibling owner of the physical link.
///
/// Cooperative only: a holder that times out proceeds anyway.
pub struct WriteWindow {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl WriteWindow {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        let _ = tx.try_send(());
        Self { tx, rx }
    }

    /// Take the token, waiting at most `timeout`.
    pub fn acquire(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Return the token. Returns false if it was not held.
    pub fn release(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }

    pub fn is_free(&self) -> bool {
        !self.rx.is_empty()
    }
}

impl Default for WriteWindow {
    fn default() -> Self {
        Self::new()
    }
}

struct PendingExchange {
    id: u64,
    response: Sender<NciFrame>,
    response_seen: bool,
    notification: Option<(u8, u8, Sender<NciFrame>)>,
}

#[derive(Default)]
struct RegistryState {
    pending: Option<PendingExchange>,
    next_id: u64,
}

/// Slot through which the read path hands frames to the waiting caller.
#[derive(Default)]
pub struct ExchangeRegistry {
    state: Mutex<RegistryState>,
}

impl ExchangeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, notification: Option<(u8, u8)>) -> PendingGuard<'_> {
        let (rsp_tx, rsp_rx) = bounded(1);
        let (ntf, ntf_rx) = match notification {
            Some((gid, oid)) => {
                let (tx, rx) = bounded(1);
                (Some((gid, oid, tx)), Some(rx))
            }
            None => (None, None),
        };

        let mut state = self.state.lock();
        state.next_id = state.next_id.wrapping_add(1);
        let id = state.next_id;
        if state.pending.is_some() {
            warn!("Replacing a stale pending exchange");
        }
        state.pending = Some(PendingExchange {
            id,
            response: rsp_tx,
            response_seen: false,
            notification: ntf,
        });

        PendingGuard {
            registry: self,
            id,
            response: rsp_rx,
            notification: ntf_rx,
        }
    }

    fn clear(&self, id: u64) {
        let mut state = self.state.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
        }
    }

    /// Offer an inbound frame. Returns true if a waiting caller consumed it.
    pub fn offer(&self, frame: &NciFrame) -> bool {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.as_mut() else {
            return false;
        };

        match frame.message_type() {
            MessageType::Response if !pending.response_seen => {
                pending.response_seen = true;
                let _ = pending.response.try_send(frame.clone());
                true
            }
            MessageType::Notification if pending.response_seen => match &pending.notification {
                Some((gid, oid, tx)) if frame.gid() == *gid && frame.oid() == *oid => {
                    let _ = tx.try_send(frame.clone());
                    pending.notification = None;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// True while a caller waits for a notification that has not arrived yet.
    pub fn awaiting_notification(&self) -> bool {
        self.state
            .lock()
            .pending
            .as_ref()
            .is_some_and(|p| p.notification.is_some())
    }
}

struct PendingGuard<'a> {
    registry: &'a ExchangeRegistry,
    id: u64,
    response: Receiver<NciFrame>,
    notification: Option<Receiver<NciFrame>>,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.registry.clear(self.id);
    }
}

/// A completed command whose follow-up notification may still be awaited.
pub struct Exchange<'a> {
    guard: PendingGuard<'a>,
    response: NciFrame,
    notification_timeout: Duration,
}

impl Exchange<'_> {
    pub fn response(&self) -> &NciFrame {
        &self.response
    }

    pub fn into_response(self) -> NciFrame {
        self.response
    }

    /// Block until the notification registered with the command arrives.
    pub fn wait_notification(&self) -> Result<NciFrame, DispatchError> {
        let Some(rx) = &self.guard.notification else {
            return Err(DispatchError::Timeout {
                what: "notification",
                timeout_ms: 0,
            });
        };
        rx.recv_timeout(self.notification_timeout)
            .map_err(|_| DispatchError::Timeout {
                what: "notification",
                timeout_ms: self.notification_timeout.as_millis() as u64,
            })
    }
}

/// Everything the dispatcher needs to reach the link and the caller.
#[derive(Clone)]
pub struct LinkHandles {
    pub transport: Arc<Transport>,
    pub channel: Arc<dyn FrameChannel>,
    pub window: Arc<WriteWindow>,
    pub exchanges: Arc<ExchangeRegistry>,
    pub queue: ClientQueue,
    pub callbacks: Arc<CallbackTable>,
    /// While `Open`, a device reset forced by the dispatcher is reported to
    /// the data callback as a synthesized reset notification.
    pub status: Arc<StatusCell>,
    pub observer: Arc<dyn HalObserver>,
}

pub struct CommandDispatcher {
    link: LinkHandles,
    timeouts: DispatchTimeouts,
}

impl CommandDispatcher {
    pub fn new(link: LinkHandles, timeouts: DispatchTimeouts) -> Self {
        Self { link, timeouts }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.link.transport
    }

    pub fn channel(&self) -> &Arc<dyn FrameChannel> {
        &self.link.channel
    }

    pub fn timeouts(&self) -> &DispatchTimeouts {
        &self.timeouts
    }

    /// Write one frame, retrying the whole transport write on failure.
    ///
    /// Exhausting the retries bounces the controller.
    #[instrument(level = "debug", skip_all, fields(len = frame.len()))]
    pub fn write(&self, frame: &[u8]) -> Result<usize, DispatchError> {
        if is_command(frame) && !self.link.window.acquire(self.timeouts.write_window()) {
            warn!(
                timeout_ms = self.timeouts.write_window_ms,
                "Write window held by another owner, proceeding"
            );
        }

        for attempt in 1..=MAX_WRITE_RETRY_COUNT {
            match self.write_once(frame) {
                Ok(n) => return Ok(n),
                Err(e @ DispatchError::Transport(TransportError::InvalidParameter(_))) => {
                    self.link.window.release();
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Write attempt failed");
                    if attempt < MAX_WRITE_RETRY_COUNT {
                        thread::sleep(WRITE_RETRY_DELAY);
                    }
                }
            }
        }

        error!(data = %hex(frame), "Write retries exhausted");
        self.link.window.release();
        self.bounce_link("write retries exhausted");
        Err(DispatchError::WriteFailed {
            attempts: MAX_WRITE_RETRY_COUNT,
        })
    }

    fn write_once(&self, frame: &[u8]) -> Result<usize, DispatchError> {
        match self
            .link
            .transport
            .write_and_wait(frame, self.timeouts.write_complete())?
        {
            TransferStatus::Success => Ok(frame.len()),
            TransferStatus::Failed => Err(DispatchError::WriteFailed { attempts: 1 }),
        }
    }

    /// Send a command and wait for its response.
    pub fn send_and_wait(&self, command: &[u8]) -> Result<NciFrame, DispatchError> {
        self.exchange(command, None).map(Exchange::into_response)
    }

    /// Send a command that is answered by a response and then a notification.
    pub fn send_and_wait_ntf(
        &self,
        command: &[u8],
        gid: u8,
        oid: u8,
    ) -> Result<(NciFrame, NciFrame), DispatchError> {
        let exchange = self.exchange(command, Some((gid, oid)))?;
        let ntf = exchange.wait_notification()?;
        Ok((exchange.into_response(), ntf))
    }

    /// Send `command` and wait for the response, leaving the exchange open
    /// for a notification keyed by `notification` (gid, oid).
    ///
    /// A missing response is retried; persistent silence bounces the
    /// controller. A non-OK status is returned as `Rejected`.
    #[instrument(level = "debug", skip(self, command), fields(cmd = %hex(command)))]
    pub fn exchange(
        &self,
        command: &[u8],
        notification: Option<(u8, u8)>,
    ) -> Result<Exchange<'_>, DispatchError> {
        let mut retries = 0;
        loop {
            // Registered before writing so an early response is not lost.
            let guard = self.link.exchanges.register(notification);
            self.write(command)?;

            match guard.response.recv_timeout(self.timeouts.response()) {
                Ok(response) => {
                    self.link.window.release();
                    trace!(rsp = %hex(response.as_bytes()), "Response matched");
                    return match response.status() {
                        Some(STATUS_OK) => Ok(Exchange {
                            guard,
                            response,
                            notification_timeout: self.timeouts.notification(),
                        }),
                        Some(status) => {
                            debug!(status = %format_args!("0x{:02X}", status), "Command rejected");
                            Err(DispatchError::Rejected {
                                status,
                                response: response.into_bytes(),
                            })
                        }
                        None => Err(FrameError::TooShort {
                            actual: response.len(),
                        }
                        .into()),
                    };
                }
                Err(_) if retries < MAX_RESPONSE_RETRY_COUNT => {
                    retries += 1;
                    // The re-sent command takes the token again.
                    self.link.window.release();
                    warn!(retries, "No response, re-sending command");
                }
                Err(_) => {
                    error!("Controller did not answer, resetting");
                    self.link.window.release();
                    self.bounce_link("response timeout");
                    return Err(DispatchError::Timeout {
                        what: "response",
                        timeout_ms: self.timeouts.response_ms,
                    });
                }
            }
        }
    }

    /// Hard-reset the controller and tell the data callback about it.
    pub fn bounce_link(&self, reason: &str) {
        warn!(reason, "Bouncing controller link");
        self.link.observer.on_event(&HalEvent::LinkReset {
            reason: reason.to_string(),
        });
        if let Err(e) = self.link.channel.reset(ResetMode::PowerCycle) {
            error!(error = %e, "Device reset failed");
        }
        if self.link.status.get() == HalStatus::Open && self.link.callbacks.has_data_callback() {
            debug!("Delivering synthesized reset notification");
            self.link
                .queue
                .post(ClientMessage::RxData(CORE_RESET_NTF_RECOVERY.to_vec()));
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::{LinkConfig, MockChannel, SimulatedController};
    use crate::dispatch::{ClientDispatcher, NfcEvent, NfcStatus};
    use crate::events::NullObserver;
    use crate::protocol::NciVersion;
    use crate::transport::{RetransmitConfig, TransferCompletion};
    use crossbeam_channel::unbounded;
    use std::sync::Weak;

    /// Keep a read pending that feeds every frame to `exchanges`.
    pub(crate) fn pump_reads(transport: &Arc<Transport>, exchanges: &Arc<ExchangeRegistry>) {
        let weak: Weak<Transport> = Arc::downgrade(transport);
        let registry = exchanges.clone();
        let completion: Arc<dyn TransferCompletion> =
            Arc::new(move |status: TransferStatus, data: &[u8]| {
                if status == TransferStatus::Success
                    && let Ok(frame) = NciFrame::from_bytes(data.to_vec())
                {
                    registry.offer(&frame);
                }
                if let Some(transport) = weak.upgrade() {
                    pump_reads(&transport, &registry);
                }
            });
        let _ = transport.read(NCI_MAX_FRAME_SIZE, completion);
    }

    pub(crate) struct Rig {
        pub mock: Arc<MockChannel>,
        pub link: LinkHandles,
        pub dispatcher: CommandDispatcher,
        pub _client: ClientDispatcher,
    }

    /// Route engine logs to the test harness output. `RUST_LOG` selects levels.
    pub(crate) fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    pub(crate) fn fast_timeouts() -> DispatchTimeouts {
        DispatchTimeouts {
            write_window_ms: 50,
            response_ms: 150,
            notification_ms: 150,
            write_complete_ms: 500,
        }
    }

    pub(crate) fn rig(mock: MockChannel) -> Rig {
        init_tracing();
        let mock = Arc::new(mock);
        let callbacks = Arc::new(CallbackTable::new());
        let client = ClientDispatcher::spawn(callbacks.clone()).unwrap();
        let transport = Arc::new(
            Transport::open(
                mock.clone(),
                &LinkConfig::default(),
                RetransmitConfig::default(),
                client.queue(),
            )
            .unwrap(),
        );
        let exchanges = Arc::new(ExchangeRegistry::new());
        pump_reads(&transport, &exchanges);

        let link = LinkHandles {
            transport,
            channel: mock.clone(),
            window: Arc::new(WriteWindow::new()),
            exchanges,
            queue: client.queue(),
            callbacks,
            status: Arc::new(StatusCell::new(Arc::new(NullObserver))),
            observer: Arc::new(NullObserver),
        };
        Rig {
            mock,
            dispatcher: CommandDispatcher::new(link.clone(), fast_timeouts()),
            link,
            _client: client,
        }
    }

    #[test]
    fn test_write_window_token() {
        let window = WriteWindow::new();
        assert!(window.is_free());
        assert!(window.acquire(Duration::from_millis(10)));
        assert!(!window.acquire(Duration::from_millis(10)));
        assert!(window.release());
        assert!(!window.release());
        assert!(window.is_free());
    }

    #[test]
    fn test_v1_reset_response_matched() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(
            NciVersion::V1,
        )));
        let rsp = r.dispatcher.send_and_wait(&CORE_RESET_CMD).unwrap();
        assert!(rsp.is(MessageType::Response, GID_CORE, OID_CORE_RESET));
        assert_eq!(rsp.payload(), &[0x00, 0x11, 0x01]);
        assert_eq!(r.mock.count_writes(&CORE_RESET_CMD), 1);
        assert!(r.link.window.is_free());
    }

    #[test]
    fn test_v2_reset_waits_for_notification() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(
            NciVersion::V2,
        )));
        let (rsp, ntf) = r
            .dispatcher
            .send_and_wait_ntf(&CORE_RESET_CMD, GID_CORE, OID_CORE_RESET)
            .unwrap();
        assert_eq!(rsp.payload(), &[0x00]);
        assert!(ntf.is(MessageType::Notification, GID_CORE, OID_CORE_RESET));
        assert!(!r.link.exchanges.awaiting_notification());
    }

    #[test]
    fn test_rejected_status_is_reported() {
        let controller = SimulatedController::new(NciVersion::V1).with_status(
            GID_CORE,
            OID_CORE_SET_CONFIG,
            STATUS_INVALID_PARAM,
        );
        let r = rig(MockChannel::with_controller(controller));
        let err = r
            .dispatcher
            .send_and_wait(&[0x20, 0x02, 0x04, 0x01, 0x00, 0x01, 0x01])
            .unwrap_err();
        assert_eq!(err.status(), Some(STATUS_INVALID_PARAM));
    }

    #[test]
    fn test_silent_controller_retries_then_resets() {
        let controller = SimulatedController::new(NciVersion::V1).silent_on(GID_CORE, OID_CORE_INIT);
        let r = rig(MockChannel::with_controller(controller));
        let err = r.dispatcher.send_and_wait(&CORE_INIT_CMD_V1).unwrap_err();
        assert!(matches!(err, DispatchError::Timeout { what: "response", .. }));
        assert_eq!(
            r.mock.count_writes(&CORE_INIT_CMD_V1),
            1 + MAX_RESPONSE_RETRY_COUNT as usize
        );
        assert_eq!(r.mock.resets(), vec![ResetMode::PowerCycle]);
    }

    #[test]
    fn test_response_retry_does_not_wait_on_own_window() {
        let controller = SimulatedController::new(NciVersion::V1).silent_on(GID_CORE, OID_CORE_INIT);
        let r = rig(MockChannel::with_controller(controller));
        let timeouts = DispatchTimeouts {
            write_window_ms: 1000,
            response_ms: 100,
            ..fast_timeouts()
        };
        let dispatcher = CommandDispatcher::new(r.link.clone(), timeouts);

        let started = std::time::Instant::now();
        assert!(dispatcher.send_and_wait(&CORE_INIT_CMD_V1).is_err());
        let elapsed = started.elapsed();

        // One response wait per attempt, well under a single window timeout.
        assert!(elapsed < Duration::from_millis(800), "took {elapsed:?}");
        assert_eq!(
            r.mock.count_writes(&CORE_INIT_CMD_V1),
            1 + MAX_RESPONSE_RETRY_COUNT as usize
        );
        assert!(r.link.window.is_free());
    }

    #[test]
    fn test_exhausted_write_retries_synthesize_reset_ntf() {
        let r = rig(MockChannel::new());
        let (tx, rx) = unbounded();
        r.link.callbacks.register(
            Arc::new(|_: NfcEvent, _: NfcStatus| {}),
            Arc::new(move |data: &[u8]| {
                let _ = tx.send(data.to_vec());
            }),
        );
        r.link.status.set(HalStatus::Open);
        r.mock.fail_all_writes(true);

        let err = r.dispatcher.write(&CORE_RESET_CMD).unwrap_err();
        assert!(matches!(err, DispatchError::WriteFailed { attempts: 3 }));
        assert_eq!(r.mock.resets(), vec![ResetMode::PowerCycle]);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(1)).unwrap(),
            CORE_RESET_NTF_RECOVERY.to_vec()
        );
        assert!(r.link.window.is_free());
    }

    #[test]
    fn test_no_synthesized_ntf_unless_reporting() {
        let r = rig(MockChannel::new());
        let (tx, rx) = unbounded();
        r.link.callbacks.register(
            Arc::new(|_: NfcEvent, _: NfcStatus| {}),
            Arc::new(move |data: &[u8]| {
                let _ = tx.send(data.to_vec());
            }),
        );
        r.mock.fail_all_writes(true);
        assert!(r.dispatcher.write(&CORE_RESET_CMD).is_err());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_contended_window_still_writes() {
        let r = rig(MockChannel::with_controller(SimulatedController::new(
            NciVersion::V1,
        )));
        assert!(r.link.window.acquire(Duration::from_millis(10)));
        let rsp = r.dispatcher.send_and_wait(&CORE_RESET_CMD).unwrap();
        assert_eq!(rsp.status(), Some(STATUS_OK));
        assert!(r.link.window.is_free());
    }

    #[test]
    fn test_data_frames_skip_the_window() {
        let r = rig(MockChannel::new());
        assert!(r.link.window.acquire(Duration::from_millis(10)));
        let started = std::time::Instant::now();
        assert_eq!(r.dispatcher.write(&[0x00, 0x00, 0x01, 0xAA]).unwrap(), 4);
        assert!(started.elapsed() < Duration::from_millis(50));
        assert!(!r.link.window.is_free());
    }
}
