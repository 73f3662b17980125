//! In-memory link for testing the transport and the engine above it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use super::traits::{ChannelError, FrameChannel, LinkConfig, ResetMode};
use crate::firmware::FirmwareVersion;
use crate::protocol::constants::*;
use crate::protocol::{MessageType, NciHeader, NciVersion};

/// Produces the controller's reaction to one written frame.
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

const READ_POLL: Duration = Duration::from_millis(5);

struct MockState {
    open: bool,
    open_count: u32,
    download_mode: bool,
    writes: Vec<Vec<u8>>,
    resets: Vec<ResetMode>,
    /// Next N writes fail.
    fail_writes: u32,
    fail_all_writes: bool,
    /// Next N reads fail.
    fail_reads: u32,
    failed_reads: u32,
    responder: Option<Responder>,
    download_responder: Option<Responder>,
}

/// Mock link that records writes and serves scripted reads.
pub struct MockChannel {
    state: Mutex<MockState>,
    rx_tx: Sender<Vec<u8>>,
    rx_rx: Receiver<Vec<u8>>,
}

impl MockChannel {
    pub fn new() -> Self {
        let (rx_tx, rx_rx) = unbounded();
        Self {
            state: Mutex::new(MockState {
                open: false,
                open_count: 0,
                download_mode: false,
                writes: Vec::new(),
                resets: Vec::new(),
                fail_writes: 0,
                fail_all_writes: false,
                fail_reads: 0,
                failed_reads: 0,
                responder: None,
                download_responder: None,
            }),
            rx_tx,
            rx_rx,
        }
    }

    /// Mock whose writes are answered by `controller`.
    pub fn with_controller(controller: SimulatedController) -> Self {
        let mock = Self::new();
        mock.set_responder(controller.into_responder());
        mock
    }

    pub fn set_responder(&self, responder: Responder) {
        self.state.lock().responder = Some(responder);
    }

    /// Responder used while the link is in download mode. Defaults to echo.
    pub fn set_download_responder(&self, responder: Responder) {
        self.state.lock().download_responder = Some(responder);
    }

    /// Queue an unsolicited frame to be returned by `read`.
    pub fn inject(&self, frame: &[u8]) {
        let _ = self.rx_tx.send(frame.to_vec());
    }

    /// Get all captured writes.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().writes.clone()
    }

    /// Number of captured writes equal to `frame`.
    pub fn count_writes(&self, frame: &[u8]) -> usize {
        self.state
            .lock()
            .writes
            .iter()
            .filter(|w| w.as_slice() == frame)
            .count()
    }

    /// Clear captured writes.
    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn resets(&self) -> Vec<ResetMode> {
        self.state.lock().resets.clone()
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_writes = count;
    }

    pub fn fail_all_writes(&self, fail: bool) {
        self.state.lock().fail_all_writes = fail;
    }

    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().fail_reads = count;
    }

    /// Reads that returned an injected failure so far.
    pub fn failed_reads(&self) -> u32 {
        self.state.lock().failed_reads
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameChannel for MockChannel {
    fn open(&self, _config: &LinkConfig) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        state.open = true;
        state.open_count += 1;
        while self.rx_rx.try_recv().is_ok() {}
        Ok(())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.open {
                    return Err(ChannelError::Closed);
                }
                if state.fail_reads > 0 {
                    state.fail_reads -= 1;
                    state.failed_reads += 1;
                    return Err(ChannelError::ReadFailed("injected failure".into()));
                }
            }
            match self.rx_rx.recv_timeout(READ_POLL) {
                Ok(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }
    }

    fn write(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(ChannelError::NotOpen);
        }
        if state.fail_all_writes {
            return Err(ChannelError::WriteFailed("injected failure".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(ChannelError::WriteFailed("injected failure".into()));
        }
        state.writes.push(data.to_vec());

        let replies = if state.download_mode {
            match state.download_responder.as_mut() {
                Some(responder) => responder(data),
                None => vec![data.to_vec()],
            }
        } else {
            match state.responder.as_mut() {
                Some(responder) => responder(data),
                None => Vec::new(),
            }
        };
        drop(state);

        for reply in replies {
            let _ = self.rx_tx.send(reply);
        }
        Ok(data.len())
    }

    fn reset(&self, mode: ResetMode) -> Result<(), ChannelError> {
        let mut state = self.state.lock();
        state.resets.push(mode);
        match mode {
            ResetMode::EnterDownload => state.download_mode = true,
            ResetMode::ExitDownload | ResetMode::PowerCycle => state.download_mode = false,
            _ => {}
        }
        Ok(())
    }

    fn close(&self) {
        self.state.lock().open = false;
    }
}

/// Scripted NFC controller answering the core command set.
#[derive(Debug, Clone)]
pub struct SimulatedController {
    pub version: NciVersion,
    pub firmware: FirmwareVersion,
    status_overrides: HashMap<(u8, u8), u8>,
    /// Status used for the next N commands with this group/opcode.
    limited_overrides: HashMap<(u8, u8), (u8, u32)>,
    silent: HashSet<(u8, u8)>,
}

impl SimulatedController {
    pub fn new(version: NciVersion) -> Self {
        Self {
            version,
            firmware: FirmwareVersion::new(0x11, 0x01, 0x0E),
            status_overrides: HashMap::new(),
            limited_overrides: HashMap::new(),
            silent: HashSet::new(),
        }
    }

    pub fn with_firmware(mut self, firmware: FirmwareVersion) -> Self {
        self.firmware = firmware;
        self
    }

    /// Answer every command with this group/opcode using `status`.
    pub fn with_status(mut self, gid: u8, oid: u8, status: u8) -> Self {
        self.status_overrides.insert((gid, oid), status);
        self
    }

    /// Answer the next `times` commands with this group/opcode using `status`.
    pub fn with_status_times(mut self, gid: u8, oid: u8, status: u8, times: u32) -> Self {
        self.limited_overrides.insert((gid, oid), (status, times));
        self
    }

    /// Never answer this group/opcode.
    pub fn silent_on(mut self, gid: u8, oid: u8) -> Self {
        self.silent.insert((gid, oid));
        self
    }

    pub fn into_responder(mut self) -> Responder {
        Box::new(move |frame| self.respond(frame))
    }

    /// Frames the controller sends back after receiving `frame`.
    pub fn respond(&mut self, frame: &[u8]) -> Vec<Vec<u8>> {
        let header = match NciHeader::parse(frame) {
            Ok(h) if h.message_type == MessageType::Command => h,
            _ => return Vec::new(),
        };
        let key = (header.gid, header.oid);
        if self.silent.contains(&key) {
            return Vec::new();
        }
        let status = match self.limited_overrides.get_mut(&key) {
            Some((status, left)) if *left > 0 => {
                *left -= 1;
                *status
            }
            _ => self.status_overrides.get(&key).copied().unwrap_or(STATUS_OK),
        };
        let fw = self.firmware;

        match key {
            (GID_CORE, OID_CORE_RESET) => match self.version {
                NciVersion::V1 => vec![vec![0x40, 0x00, 0x03, status, 0x11, 0x01]],
                NciVersion::V2 => vec![
                    vec![0x40, 0x00, 0x01, status],
                    vec![
                        0x60, 0x00, 0x09, 0x02, 0x01, 0x20, 0x04, 0x04, 0x51, fw.rom, fw.major,
                        fw.minor,
                    ],
                ],
            },
            (GID_CORE, OID_CORE_INIT) => {
                let mut rsp = vec![0x40, 0x01, 0x00, status];
                match self.version {
                    NciVersion::V1 => rsp.extend_from_slice(&[
                        0x1E, 0x03, 0x00, 0x08, 0x01, 0x02, 0x01, 0x00, 0x02, 0xFF, 0x00, 0x00,
                        0x04, 0x51, fw.rom, fw.major, fw.minor,
                    ]),
                    NciVersion::V2 => rsp.extend_from_slice(&[
                        0x1A, 0x1E, 0x03, 0x00, 0x01, 0x00, 0x02, 0xFF, 0xFF, 0x01, 0x00, 0x01,
                        0x02, 0x01, 0x01,
                    ]),
                }
                rsp[2] = (rsp.len() - NCI_HEADER_SIZE) as u8;
                vec![rsp]
            }
            (gid, oid) => vec![vec![0x40 | gid, oid, 0x01, status]],
        }
    }
}
