//! HAL facade: the public entry points of the engine.
//!
//! `NciHal` owns the control state behind one lock, so `open`, `write`,
//! `close`, `ioctl` and the rest run one at a time. Completion events are
//! delivered asynchronously on the client dispatch thread.
//!
//! Callbacks run on that dispatch thread, which also routes controller
//! responses. A callback must therefore never call back into a blocking
//! `NciHal` operation; hand the work to another thread instead.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::bringup::{BringUp, BringUpContext, BringUpError, BringUpState};
use crate::channel::{ChannelError, FrameChannel, ObservableChannel, ResetMode};
use crate::command::{CommandDispatcher, DispatchError, ExchangeRegistry, LinkHandles, WriteWindow};
use crate::config::{HalConfig, power_mode_command};
use crate::dispatch::{
    CallbackTable, ClientDispatcher, ClientMessage, DataCallback, NfcStatus, StackCallback,
};
use crate::events::{HalEvent, HalObserver, TracingObserver};
use crate::firmware::{FirmwareDownloader, FirmwareVersion};
use crate::link::{InboundRouter, TransportDownloadPort};
use crate::protocol::constants::POWER_CYCLE_SETTLE;
use crate::protocol::{FrameError, NciFrame, NciVersion};
use crate::transport::{Transport, TransportError};

#[derive(Error, Debug)]
pub enum HalError {
    #[error("HAL not open")]
    NotOpen,

    #[error("Bring-up failed: {0}")]
    BringUp(#[from] BringUpError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Link error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("Failed to start client dispatch thread: {0}")]
    Thread(#[source] std::io::Error),
}

impl HalError {
    /// Status reported alongside the completion event for this error.
    pub fn nfc_status(&self) -> NfcStatus {
        match self {
            HalError::Dispatch(DispatchError::Timeout { .. })
            | HalError::BringUp(BringUpError::Init(DispatchError::Timeout { .. })) => {
                NfcStatus::ErrCmdTimeout
            }
            HalError::Transport(_) | HalError::Channel(_) => NfcStatus::ErrTransport,
            HalError::BringUp(BringUpError::Reset { .. }) => NfcStatus::ErrTransport,
            _ => NfcStatus::Failed,
        }
    }
}

/// Lifecycle of the HAL as seen by callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HalStatus {
    #[default]
    Closed,
    /// Link up and controller initialized for side-channel use only.
    MinOpen,
    Open,
}

impl fmt::Display for HalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HalStatus::Closed => write!(f, "CLOSED"),
            HalStatus::MinOpen => write!(f, "MIN_OPEN"),
            HalStatus::Open => write!(f, "OPEN"),
        }
    }
}

/// Status shared with the read path, reporting every change.
pub struct StatusCell {
    status: Mutex<HalStatus>,
    observer: Arc<dyn HalObserver>,
}

impl StatusCell {
    pub fn new(observer: Arc<dyn HalObserver>) -> Self {
        Self {
            status: Mutex::new(HalStatus::Closed),
            observer,
        }
    }

    pub fn get(&self) -> HalStatus {
        *self.status.lock()
    }

    /// Store `to` and return the previous status.
    pub fn set(&self, to: HalStatus) -> HalStatus {
        let from = std::mem::replace(&mut *self.status.lock(), to);
        if from != to {
            self.observer.on_event(&HalEvent::StatusChanged { from, to });
        }
        from
    }
}

/// Controller power state selectable through `ioctl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Standby,
    FullPower,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlRequest {
    SetPowerState(PowerState),
    GetFirmwareVersion,
    /// Take the write window on behalf of the secure-element owner.
    AcquireWriteWindow { timeout: Duration },
    ReleaseWriteWindow,
    /// Tell the stack the HCI network was reset.
    HciNetworkReset,
    PowerCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoctlResponse {
    Done,
    FirmwareVersion(FirmwareVersion),
    WindowAcquired(bool),
}

/// Resources that live exactly as long as the link is up.
struct Session {
    transport: Arc<Transport>,
    commands: CommandDispatcher,
    port: TransportDownloadPort,
}

#[derive(Default)]
struct ControlState {
    client: Option<ClientDispatcher>,
    session: Option<Session>,
    bringup: BringUpContext,
}

impl ControlState {
    fn post(&self, message: ClientMessage) {
        match &self.client {
            Some(client) => {
                client.post(message);
            }
            None => debug!(message = ?message, "No dispatch thread, message dropped"),
        }
    }
}

pub struct NciHal {
    channel: Arc<dyn FrameChannel>,
    config: HalConfig,
    downloader: Option<Arc<dyn FirmwareDownloader>>,
    observer: Arc<dyn HalObserver>,
    callbacks: Arc<CallbackTable>,
    window: Arc<WriteWindow>,
    exchanges: Arc<ExchangeRegistry>,
    status: Arc<StatusCell>,
    router: Arc<InboundRouter>,
    control: Mutex<ControlState>,
}

impl NciHal {
    /// Create a HAL that reports events through `tracing`.
    pub fn new(channel: Arc<dyn FrameChannel>, config: HalConfig) -> Self {
        Self::with_observer(channel, config, Arc::new(TracingObserver))
    }

    pub fn with_observer(
        channel: Arc<dyn FrameChannel>,
        config: HalConfig,
        observer: Arc<dyn HalObserver>,
    ) -> Self {
        let callbacks = Arc::new(CallbackTable::new());
        let window = Arc::new(WriteWindow::new());
        let exchanges = Arc::new(ExchangeRegistry::new());
        let status = Arc::new(StatusCell::new(observer.clone()));
        let router = Arc::new(InboundRouter::new(
            exchanges.clone(),
            window.clone(),
            callbacks.clone(),
            status.clone(),
        ));
        Self {
            channel,
            config,
            downloader: None,
            observer,
            callbacks,
            window,
            exchanges,
            status,
            router,
            control: Mutex::new(ControlState::default()),
        }
    }

    /// Firmware image offered to the controller during bring-up.
    pub fn with_downloader(mut self, downloader: Arc<dyn FirmwareDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    pub fn config(&self) -> &HalConfig {
        &self.config
    }

    pub fn status(&self) -> HalStatus {
        self.status.get()
    }

    /// True while a transport session exists.
    pub fn has_transport(&self) -> bool {
        self.control.lock().session.is_some()
    }

    pub fn firmware_version(&self) -> FirmwareVersion {
        self.control.lock().bringup.firmware
    }

    pub fn nci_version(&self) -> NciVersion {
        self.control.lock().bringup.nci_version
    }

    pub fn bringup_state(&self) -> BringUpState {
        self.control.lock().bringup.state
    }

    /// Register the callbacks and bring the controller up.
    ///
    /// Completion is reported as `OpenComplete` on the stack callback. An
    /// already open HAL answers without touching the link.
    #[instrument(level = "info", skip_all)]
    pub fn open(
        &self,
        stack: Arc<dyn StackCallback>,
        data: Arc<dyn DataCallback>,
    ) -> Result<(), HalError> {
        let mut control = self.control.lock();
        self.callbacks.register(stack, data);

        match self.status.get() {
            HalStatus::Open => {
                info!("Already open");
                self.ensure_client(&mut control)?;
                control.post(ClientMessage::OpenComplete(NfcStatus::Ok));
                return Ok(());
            }
            HalStatus::MinOpen if control.bringup.state != BringUpState::Failed => {
                info!("Promoting minimal session to full open");
                self.status.set(HalStatus::Open);
                control.post(ClientMessage::OpenComplete(NfcStatus::Ok));
                return Ok(());
            }
            _ => {}
        }

        match self.start(&mut control) {
            Ok(()) => {
                self.status.set(HalStatus::Open);
                control.post(ClientMessage::OpenComplete(NfcStatus::Ok));
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Open failed");
                control.post(ClientMessage::OpenComplete(e.nfc_status()));
                self.teardown(&mut control);
                Err(e)
            }
        }
    }

    /// Send one NCI frame. Returns the number of bytes written.
    #[instrument(level = "debug", skip_all, fields(len = data.len()))]
    pub fn write(&self, data: &[u8]) -> Result<usize, HalError> {
        let control = self.control.lock();
        if self.status.get() != HalStatus::Open {
            return Err(HalError::NotOpen);
        }
        let session = control.session.as_ref().ok_or(HalError::NotOpen)?;
        Ok(session.commands.write(data)?)
    }

    /// Tear the session down. A closed HAL answers `NotOpen` and does nothing.
    #[instrument(level = "info", skip(self))]
    pub fn close(&self, is_shutdown: bool) -> Result<(), HalError> {
        let mut control = self.control.lock();
        if self.status.get() == HalStatus::Closed {
            return Err(HalError::NotOpen);
        }

        if is_shutdown
            && self.config.power_off_on_shutdown
            && let Some(session) = &control.session
        {
            match self.config.power_off_command() {
                Ok(cmd) => {
                    if let Err(e) = session.commands.send_and_wait(cmd.as_bytes()) {
                        warn!(error = %e, "Power-off setting not accepted");
                    }
                }
                Err(e) => warn!(error = %e, "Could not build power-off command"),
            }
        }

        self.status.set(HalStatus::Closed);
        control.post(ClientMessage::CloseComplete(NfcStatus::Ok));
        self.teardown(&mut control);
        control
            .bringup
            .goto_state(BringUpState::Closed, self.observer.as_ref());
        info!("HAL closed");
        Ok(())
    }

    /// Side-channel control. A closed HAL is first opened in minimal mode.
    #[instrument(level = "debug", skip(self))]
    pub fn ioctl(&self, request: IoctlRequest) -> Result<IoctlResponse, HalError> {
        let mut control = self.control.lock();
        if self.status.get() == HalStatus::Closed {
            info!("HAL closed, opening in minimal mode");
            if let Err(e) = self.start(&mut control) {
                self.teardown(&mut control);
                return Err(e);
            }
        }

        match request {
            IoctlRequest::SetPowerState(state) => {
                let session = control.session.as_ref().ok_or(HalError::NotOpen)?;
                let cmd = power_mode_command(state == PowerState::Standby)?;
                session.commands.send_and_wait(cmd.as_bytes())?;
                Ok(IoctlResponse::Done)
            }
            IoctlRequest::GetFirmwareVersion => {
                Ok(IoctlResponse::FirmwareVersion(control.bringup.firmware))
            }
            IoctlRequest::AcquireWriteWindow { timeout } => {
                Ok(IoctlResponse::WindowAcquired(self.window.acquire(timeout)))
            }
            IoctlRequest::ReleaseWriteWindow => {
                if !self.window.release() {
                    debug!("Write window was not held");
                }
                Ok(IoctlResponse::Done)
            }
            IoctlRequest::HciNetworkReset => {
                control.post(ClientMessage::HciNetworkReset);
                Ok(IoctlResponse::Done)
            }
            IoctlRequest::PowerCycle => {
                self.cycle_power(&control)?;
                Ok(IoctlResponse::Done)
            }
        }
    }

    /// Hard-reset the controller without closing the session.
    #[instrument(level = "info", skip(self))]
    pub fn power_cycle(&self) -> Result<(), HalError> {
        let control = self.control.lock();
        self.cycle_power(&control)
    }

    /// Apply the configuration once the stack has seen CORE_INIT.
    ///
    /// `init_response` is the CORE_INIT_RSP the stack received, or empty.
    #[instrument(level = "info", skip_all, fields(len = init_response.len()))]
    pub fn core_initialized(&self, init_response: &[u8]) -> Result<(), HalError> {
        let mut control = self.control.lock();
        if self.status.get() != HalStatus::Open {
            return Err(HalError::NotOpen);
        }

        if !init_response.is_empty() && control.bringup.nci_version == NciVersion::V1 {
            match NciFrame::from_bytes(init_response.to_vec()) {
                Ok(rsp) => {
                    if let Some(fw) = FirmwareVersion::from_init_response(&rsp) {
                        control.bringup.firmware = fw;
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed init response"),
            }
        }

        match self.run_bringup(&mut control, |b| b.apply_config()) {
            Ok(()) => {
                control.post(ClientMessage::PostInitComplete(NfcStatus::Ok));
                Ok(())
            }
            Err(e) => {
                control.post(ClientMessage::PostInitComplete(e.nfc_status()));
                self.status.set(HalStatus::Closed);
                self.teardown(&mut control);
                Err(e)
            }
        }
    }

    /// Hook run before RF discovery starts. No controller traffic.
    pub fn pre_discover(&self) -> Result<(), HalError> {
        let control = self.control.lock();
        if self.status.get() == HalStatus::Closed {
            return Err(HalError::NotOpen);
        }
        control.post(ClientMessage::PreDiscoverComplete(NfcStatus::Ok));
        Ok(())
    }

    fn ensure_client(&self, control: &mut ControlState) -> Result<(), HalError> {
        if control.client.is_none() {
            let client =
                ClientDispatcher::spawn(self.callbacks.clone()).map_err(HalError::Thread)?;
            control.client = Some(client);
        }
        Ok(())
    }

    /// Start the link and run the cold-open bring-up. Leaves the HAL in
    /// `MinOpen` on success.
    fn start(&self, control: &mut ControlState) -> Result<(), HalError> {
        self.ensure_session(control)?;
        self.run_bringup(control, |b| b.open())
    }

    fn ensure_session(&self, control: &mut ControlState) -> Result<(), HalError> {
        if control.session.is_some() {
            return Ok(());
        }
        self.ensure_client(control)?;
        let queue = match &control.client {
            Some(client) => client.queue(),
            None => return Err(HalError::NotOpen),
        };

        let channel: Arc<dyn FrameChannel> = Arc::new(ObservableChannel::new(
            self.channel.clone(),
            self.observer.clone(),
        ));
        let transport = Arc::new(Transport::open(
            channel.clone(),
            &self.config.link,
            self.config.retransmission,
            queue.clone(),
        )?);
        self.status.set(HalStatus::MinOpen);
        self.router.arm(&transport)?;

        let commands = CommandDispatcher::new(
            LinkHandles {
                transport: transport.clone(),
                channel: channel.clone(),
                window: self.window.clone(),
                exchanges: self.exchanges.clone(),
                queue,
                callbacks: self.callbacks.clone(),
                status: self.status.clone(),
                observer: self.observer.clone(),
            },
            self.config.timeouts,
        );
        let port = TransportDownloadPort::new(
            transport.clone(),
            channel,
            self.router.clone(),
            self.config.timeouts.write_complete(),
        );

        control.session = Some(Session {
            transport,
            commands,
            port,
        });
        control.bringup = BringUpContext::new();
        debug!("Session started");
        Ok(())
    }

    fn run_bringup<R>(
        &self,
        control: &mut ControlState,
        step: impl FnOnce(&mut BringUp<'_>) -> Result<R, BringUpError>,
    ) -> Result<R, HalError> {
        let ControlState {
            session, bringup, ..
        } = control;
        let session = session.as_ref().ok_or(HalError::NotOpen)?;
        let mut machine = BringUp::new(
            &session.commands,
            &self.config,
            self.downloader.as_deref(),
            &session.port,
            self.observer.as_ref(),
            bringup,
        );
        Ok(step(&mut machine)?)
    }

    fn cycle_power(&self, control: &ControlState) -> Result<(), HalError> {
        if self.status.get() == HalStatus::Closed {
            return Err(HalError::NotOpen);
        }
        let session = control.session.as_ref().ok_or(HalError::NotOpen)?;
        self.observer.on_event(&HalEvent::LinkReset {
            reason: "power cycle requested".into(),
        });
        session.commands.channel().reset(ResetMode::PowerCycle)?;
        thread::sleep(POWER_CYCLE_SETTLE);
        if self.status.get() == HalStatus::Open {
            control.post(ClientMessage::OpenComplete(NfcStatus::Ok));
        }
        Ok(())
    }

    /// Release every session resource. Safe to call repeatedly.
    fn teardown(&self, control: &mut ControlState) {
        self.status.set(HalStatus::Closed);
        if let Some(session) = control.session.take() {
            session.transport.shutdown();
        }
        // Delivers everything already posted, then exits.
        if let Some(mut client) = control.client.take() {
            client.stop();
        }
        self.callbacks.clear();
        self.window.release();
    }
}

impl Drop for NciHal {
    fn drop(&mut self) {
        let mut control = self.control.lock();
        self.teardown(&mut control);
    }
}
