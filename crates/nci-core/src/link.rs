//! Inbound frame routing and the download-mode link.
//!
//! The router keeps a read pending on the transport and decides where each
//! completed read goes: an active flashing session, the waiting command
//! exchange, or the caller's data callback.

use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::channel::{FrameChannel, ResetMode};
use crate::command::{ExchangeRegistry, WriteWindow};
use crate::dispatch::CallbackTable;
use crate::firmware::{DownloadLink, DownloadPort, FirmwareError};
use crate::hal::{HalStatus, StatusCell};
use crate::protocol::constants::NCI_MAX_FRAME_SIZE;
use crate::protocol::{MessageType, NciFrame, hex};
use crate::transport::{
    RetransmitConfig, TransferCompletion, TransferStatus, Transport, TransportError,
};

pub struct InboundRouter {
    exchanges: Arc<ExchangeRegistry>,
    window: Arc<WriteWindow>,
    callbacks: Arc<CallbackTable>,
    status: Arc<StatusCell>,
    download: Mutex<Option<Sender<Vec<u8>>>>,
}

impl InboundRouter {
    pub fn new(
        exchanges: Arc<ExchangeRegistry>,
        window: Arc<WriteWindow>,
        callbacks: Arc<CallbackTable>,
        status: Arc<StatusCell>,
    ) -> Self {
        Self {
            exchanges,
            window,
            callbacks,
            status,
            download: Mutex::new(None),
        }
    }

    /// Make sure a read is pending. An already pending read is not an error.
    pub fn arm(self: &Arc<Self>, transport: &Arc<Transport>) -> Result<(), TransportError> {
        let weak = Arc::downgrade(transport);
        let router = self.clone();
        let completion: Arc<dyn TransferCompletion> =
            Arc::new(move |status: TransferStatus, data: &[u8]| {
                router.on_read(&weak, status, data);
            });
        match transport.read(NCI_MAX_FRAME_SIZE, completion) {
            Ok(()) | Err(TransportError::Busy(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn on_read(self: &Arc<Self>, transport: &Weak<Transport>, status: TransferStatus, data: &[u8]) {
        if status == TransferStatus::Success {
            self.route(data);
        }
        if !self.keep_reading() {
            debug!("HAL closed, read left unarmed");
            return;
        }
        if let Some(transport) = transport.upgrade()
            && let Err(e) = self.arm(&transport)
        {
            debug!(error = %e, "Could not re-arm read");
        }
    }

    fn keep_reading(&self) -> bool {
        self.status.get() != HalStatus::Closed
            || self.exchanges.awaiting_notification()
            || self.download.lock().is_some()
    }

    /// Hand one inbound frame to whoever is waiting for it.
    pub fn route(&self, data: &[u8]) {
        if let Some(sink) = self.download.lock().as_ref() {
            trace!(len = data.len(), "Download answer");
            let _ = sink.send(data.to_vec());
            return;
        }

        let frame = match NciFrame::from_bytes(data.to_vec()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, data = %hex(data), "Discarding malformed frame");
                return;
            }
        };
        if self.exchanges.offer(&frame) {
            return;
        }
        if frame.message_type() == MessageType::Response {
            // Answer to a raw write; nobody else returns its token.
            self.window.release();
        }
        if self.status.get() == HalStatus::Open {
            self.callbacks.deliver_data(frame.as_bytes());
        } else {
            debug!(frame = ?frame, "HAL not open, frame dropped");
        }
    }

    fn open_download_sink(&self) -> Receiver<Vec<u8>> {
        let (tx, rx) = unbounded();
        *self.download.lock() = Some(tx);
        rx
    }

    fn close_download_sink(&self) {
        *self.download.lock() = None;
    }
}

/// Download port backed by the session transport.
pub struct TransportDownloadPort {
    transport: Arc<Transport>,
    channel: Arc<dyn FrameChannel>,
    router: Arc<InboundRouter>,
    write_timeout: Duration,
}

impl TransportDownloadPort {
    pub fn new(
        transport: Arc<Transport>,
        channel: Arc<dyn FrameChannel>,
        router: Arc<InboundRouter>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            channel,
            router,
            write_timeout,
        }
    }
}

impl DownloadPort for TransportDownloadPort {
    fn enter(&self) -> Result<Box<dyn DownloadLink + '_>, FirmwareError> {
        let saved = self.transport.retransmission();
        // Bootloader chunks are not NCI; never retransmit them.
        self.transport.configure_retransmission(RetransmitConfig {
            enabled: false,
            ..saved
        });
        let answers = self.router.open_download_sink();
        let active = ActiveDownload {
            port: self,
            answers,
            saved,
        };

        self.channel
            .reset(ResetMode::EnterDownload)
            .map_err(|e| FirmwareError::Link(e.to_string()))?;
        self.router
            .arm(&self.transport)
            .map_err(|e| FirmwareError::Link(e.to_string()))?;
        debug!("Link in download mode");
        Ok(Box::new(active))
    }
}

struct ActiveDownload<'a> {
    port: &'a TransportDownloadPort,
    answers: Receiver<Vec<u8>>,
    saved: RetransmitConfig,
}

impl DownloadLink for ActiveDownload<'_> {
    fn transceive(&self, chunk: &[u8], timeout: Duration) -> Result<Vec<u8>, FirmwareError> {
        while self.answers.try_recv().is_ok() {}

        match self.port.transport.write_and_wait(chunk, self.port.write_timeout) {
            Ok(TransferStatus::Success) => {}
            Ok(TransferStatus::Failed) => {
                return Err(FirmwareError::Link("chunk write failed".into()));
            }
            Err(e) => return Err(FirmwareError::Link(e.to_string())),
        }
        self.answers
            .recv_timeout(timeout)
            .map_err(|_| FirmwareError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })
    }
}

impl Drop for ActiveDownload<'_> {
    fn drop(&mut self) {
        let port = self.port;
        port.router.close_download_sink();
        if let Err(e) = port.channel.reset(ResetMode::ExitDownload) {
            warn!(error = %e, "Failed to leave download mode");
        }
        port.transport.configure_retransmission(self.saved);
        if let Err(e) = port.router.arm(&port.transport) {
            warn!(error = %e, "Could not restore pending read after download");
        }
        debug!("Link back in NCI mode");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{LinkConfig, MockChannel};
    use crate::dispatch::{ClientDispatcher, NfcEvent, NfcStatus};
    use crate::events::NullObserver;

    struct Setup {
        mock: Arc<MockChannel>,
        transport: Arc<Transport>,
        router: Arc<InboundRouter>,
        status: Arc<StatusCell>,
        data: Receiver<Vec<u8>>,
        _client: ClientDispatcher,
    }

    fn setup() -> Setup {
        let mock = Arc::new(MockChannel::new());
        let callbacks = Arc::new(CallbackTable::new());
        let (tx, data) = unbounded();
        callbacks.register(
            Arc::new(|_: NfcEvent, _: NfcStatus| {}),
            Arc::new(move |d: &[u8]| {
                let _ = tx.send(d.to_vec());
            }),
        );
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
        let status = Arc::new(StatusCell::new(Arc::new(NullObserver)));
        status.set(HalStatus::Open);
        let router = Arc::new(InboundRouter::new(
            Arc::new(ExchangeRegistry::new()),
            Arc::new(WriteWindow::new()),
            callbacks,
            status.clone(),
        ));
        router.arm(&transport).unwrap();
        Setup {
            mock,
            transport,
            router,
            status,
            data,
            _client: client,
        }
    }

    const WAIT: Duration = Duration::from_secs(1);

    fn eventually(cond: impl Fn() -> bool) -> bool {
        let deadline = std::time::Instant::now() + WAIT;
        while std::time::Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_read_stays_pending_across_frames() {
        let s = setup();
        s.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        s.mock.inject(&[0x00, 0x00, 0x01, 0xAA]);
        assert_eq!(s.data.recv_timeout(WAIT).unwrap(), vec![0x60, 0x07, 0x01, 0x03]);
        assert_eq!(s.data.recv_timeout(WAIT).unwrap(), vec![0x00, 0x00, 0x01, 0xAA]);
        assert!(eventually(|| s.transport.is_read_pending()));
    }

    #[test]
    fn test_malformed_frame_discarded() {
        let s = setup();
        s.mock.inject(&[0x60, 0x07, 0x05, 0x03]);
        s.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        assert_eq!(s.data.recv_timeout(WAIT).unwrap(), vec![0x60, 0x07, 0x01, 0x03]);
    }

    #[test]
    fn test_frames_not_forwarded_unless_open() {
        let s = setup();
        s.status.set(HalStatus::MinOpen);
        s.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        assert!(s.data.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(eventually(|| s.transport.is_read_pending()));
    }

    #[test]
    fn test_read_not_rearmed_when_closed() {
        let s = setup();
        s.status.set(HalStatus::Closed);
        s.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        std::thread::sleep(Duration::from_millis(100));
        assert!(!s.transport.is_read_pending());
    }

    #[test]
    fn test_download_session_routes_answers() {
        let s = setup();
        let port = TransportDownloadPort::new(s.transport.clone(), s.mock.clone(), s.router.clone(), WAIT);
        {
            let link = port.enter().unwrap();
            let answer = link.transceive(&[0x00, 0x02, 0xDE, 0xAD], WAIT).unwrap();
            assert_eq!(answer, vec![0x00, 0x02, 0xDE, 0xAD]);
        }
        assert_eq!(
            s.mock.resets(),
            vec![ResetMode::EnterDownload, ResetMode::ExitDownload]
        );
        assert!(s.transport.is_read_pending());
        // Back on the NCI path.
        s.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        assert_eq!(s.data.recv_timeout(WAIT).unwrap(), vec![0x60, 0x07, 0x01, 0x03]);
    }
}
