//! Threaded transport over a `FrameChannel`.
//!
//! One reader and one writer thread each own a single request slot. `read`
//! and `write` queue a request and return at once; the thread performs the
//! physical I/O and posts the completion to the client queue, so callers
//! always observe completions on the dispatch thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, trace, warn};

use super::sync::{Semaphore, join_with_timeout};
use super::timer::Timer;
use crate::channel::{ChannelError, FrameChannel, LinkConfig};
use crate::dispatch::ClientQueue;
use crate::protocol::constants::*;
use crate::protocol::{MessageType, hex, is_control_packet, message_type_of};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("{0} request already in flight")]
    Busy(Direction),

    #[error("{0} not completed within {1}ms")]
    Timeout(Direction, u64),

    #[error("Link error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Failed to spawn transport thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Read => write!(f, "Read"),
            Direction::Write => write!(f, "Write"),
        }
    }
}

/// Outcome handed to a `TransferCompletion`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed,
}

/// Completion capability supplied with every read/write request.
pub trait TransferCompletion: Send + Sync {
    /// `data` is the frame read, or the frame that was written.
    fn on_complete(&self, status: TransferStatus, data: &[u8]);
}

impl<F> TransferCompletion for F
where
    F: Fn(TransferStatus, &[u8]) + Send + Sync,
{
    fn on_complete(&self, status: TransferStatus, data: &[u8]) {
        self(status, data)
    }
}

/// Link-level retransmission of control frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetransmitConfig {
    pub enabled: bool,
    pub max_retries: u8,
    pub interval_ms: u64,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_retries: 3,
            interval_ms: 200,
        }
    }
}

/// Request slot for one direction.
#[derive(Default)]
struct Slot {
    busy: bool,
    enabled: bool,
    /// Bumped on every new request and on abort, so a thread that was
    /// blocked in I/O can tell its request went stale.
    generation: u64,
    /// Frame to write, or requested read size.
    data: Vec<u8>,
    len: usize,
    completion: Option<Arc<dyn TransferCompletion>>,
}

impl Slot {
    fn disable(&mut self) {
        self.enabled = false;
        self.busy = false;
        self.completion = None;
        self.generation = self.generation.wrapping_add(1);
    }
}

#[derive(Debug, Default)]
struct RetransmitState {
    config: RetransmitConfig,
    retry_count: u8,
    /// Last control frame sent and not yet answered.
    frame: Option<Vec<u8>>,
    awaiting_ack: bool,
    /// Timer asked the writer to resend `frame`.
    resend_pending: bool,
    physical_writes: u32,
}

struct Shared {
    channel: Arc<dyn FrameChannel>,
    running: AtomicBool,
    read_slot: Mutex<Slot>,
    write_slot: Mutex<Slot>,
    read_wake: Semaphore,
    write_wake: Semaphore,
    retransmit: Mutex<RetransmitState>,
    timer: Timer,
    queue: ClientQueue,
}

/// Handle to a running transport.
pub struct Transport {
    shared: Arc<Shared>,
    threads: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Transport {
    /// Open the link and start the reader, writer and retransmission timer threads.
    #[instrument(level = "info", skip(channel, queue), fields(device = %config.device))]
    pub fn open(
        channel: Arc<dyn FrameChannel>,
        config: &LinkConfig,
        retransmit: RetransmitConfig,
        queue: ClientQueue,
    ) -> Result<Self, TransportError> {
        channel.open(config)?;

        let (timer, timer_runner) = Timer::new();
        let shared = Arc::new(Shared {
            channel,
            running: AtomicBool::new(true),
            read_slot: Mutex::new(Slot::default()),
            write_slot: Mutex::new(Slot::default()),
            read_wake: Semaphore::new(),
            write_wake: Semaphore::new(),
            retransmit: Mutex::new(RetransmitState {
                config: retransmit,
                ..Default::default()
            }),
            timer,
            queue,
        });

        // Dropping a partially started transport shuts it down.
        let transport = Transport {
            shared: shared.clone(),
            threads: Mutex::new(Vec::with_capacity(3)),
        };

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let timer_thread = timer_runner
            .spawn("nci-retransmit", move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_retransmit_timeout();
                }
            })
            .map_err(TransportError::ThreadSpawn)?;
        transport.threads.lock().push(("nci-retransmit", timer_thread));

        let reader_shared = shared.clone();
        let reader = thread::Builder::new()
            .name("nci-reader".into())
            .spawn(move || reader_loop(reader_shared))
            .map_err(TransportError::ThreadSpawn)?;
        transport.threads.lock().push(("nci-reader", reader));

        let writer_shared = shared;
        let writer = thread::Builder::new()
            .name("nci-writer".into())
            .spawn(move || writer_loop(writer_shared))
            .map_err(TransportError::ThreadSpawn)?;
        transport.threads.lock().push(("nci-writer", writer));

        info!("Transport started");
        Ok(transport)
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// True while any transport thread is still owned by this handle.
    pub fn has_threads(&self) -> bool {
        !self.threads.lock().is_empty()
    }

    /// Queue a read of up to `max_len` bytes.
    pub fn read(
        &self,
        max_len: usize,
        completion: Arc<dyn TransferCompletion>,
    ) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::InvalidParameter("transport not open"));
        }
        if max_len == 0 {
            return Err(TransportError::InvalidParameter("zero-length read"));
        }
        {
            let mut slot = self.shared.read_slot.lock();
            if slot.busy {
                return Err(TransportError::Busy(Direction::Read));
            }
            slot.busy = true;
            slot.enabled = true;
            slot.generation = slot.generation.wrapping_add(1);
            slot.len = max_len;
            slot.completion = Some(completion);
        }
        self.shared.read_wake.post();
        Ok(())
    }

    /// Queue a write of `data`.
    pub fn write(
        &self,
        data: &[u8],
        completion: Arc<dyn TransferCompletion>,
    ) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::InvalidParameter("transport not open"));
        }
        if data.is_empty() {
            return Err(TransportError::InvalidParameter("empty write"));
        }
        {
            let mut slot = self.shared.write_slot.lock();
            if slot.busy {
                return Err(TransportError::Busy(Direction::Write));
            }
            slot.busy = true;
            slot.enabled = true;
            slot.generation = slot.generation.wrapping_add(1);
            slot.data = data.to_vec();
            slot.len = data.len();
            slot.completion = Some(completion);
        }
        self.shared.write_wake.post();
        Ok(())
    }

    /// Queue a write and block until it completes or `timeout` passes.
    ///
    /// Must not be called on the client dispatch thread, which is where the
    /// completion runs.
    pub fn write_and_wait(
        &self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<TransferStatus, TransportError> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.write(
            data,
            Arc::new(move |status: TransferStatus, _: &[u8]| {
                let _ = tx.try_send(status);
            }),
        )?;
        match rx.recv_timeout(timeout) {
            Ok(status) => Ok(status),
            Err(_) => {
                self.write_abort();
                Err(TransportError::Timeout(
                    Direction::Write,
                    timeout.as_millis() as u64,
                ))
            }
        }
    }

    /// Cancel the pending read, if any. Idempotent.
    pub fn read_abort(&self) {
        self.shared.read_slot.lock().disable();
        debug!("Read aborted");
    }

    /// Cancel the pending write and any retransmission of it. Idempotent.
    pub fn write_abort(&self) {
        self.shared.write_slot.lock().disable();
        self.shared.cancel_retransmission();
        debug!("Write aborted");
    }

    pub fn is_read_pending(&self) -> bool {
        self.shared.read_slot.lock().busy
    }

    pub fn retransmission(&self) -> RetransmitConfig {
        self.shared.retransmit.lock().config
    }

    pub fn configure_retransmission(&self, config: RetransmitConfig) {
        let mut state = self.shared.retransmit.lock();
        state.config = config;
        if !config.enabled {
            state.awaiting_ack = false;
            state.resend_pending = false;
            self.shared.timer.stop();
        }
    }

    /// Physical write attempts (fresh and retransmitted) that reached the link.
    pub fn physical_writes(&self) -> u32 {
        self.shared.retransmit.lock().physical_writes
    }

    /// Stop both threads and close the link.
    ///
    /// Always completes: threads that miss the join deadline are detached
    /// and the failure is only logged.
    #[instrument(level = "info", skip(self))]
    pub fn shutdown(&self) {
        let was_running = self.shared.running.swap(false, Ordering::SeqCst);
        if !was_running && !self.has_threads() {
            return;
        }

        self.read_abort();
        self.write_abort();
        self.shared.timer.shutdown();
        // Unblocks a reader parked in the physical read.
        self.shared.channel.close();
        self.shared.read_wake.post();
        self.shared.write_wake.post();

        let threads = std::mem::take(&mut *self.threads.lock());
        for (name, handle) in threads {
            join_with_timeout(handle, name, THREAD_JOIN_TIMEOUT);
        }
        info!("Transport shut down");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Post a completion that frees the slot right before the callback runs.
    fn complete(
        self: &Arc<Self>,
        direction: Direction,
        generation: u64,
        completion: Arc<dyn TransferCompletion>,
        status: TransferStatus,
        data: Vec<u8>,
    ) {
        let shared = self.clone();
        self.queue.defer(move || {
            {
                let mut slot = match direction {
                    Direction::Read => shared.read_slot.lock(),
                    Direction::Write => shared.write_slot.lock(),
                };
                if slot.generation != generation {
                    trace!(direction = %direction, "Completion for aborted request dropped");
                    return;
                }
                slot.busy = false;
                slot.completion = None;
            }
            completion.on_complete(status, &data);
        });
    }

    fn write_physical(&self, data: &[u8]) -> Result<usize, ChannelError> {
        let mut attempt = 1;
        loop {
            match self.channel.write(data) {
                Ok(n) => {
                    self.retransmit.lock().physical_writes += 1;
                    return Ok(n);
                }
                Err(e) if attempt < MAX_PHYSICAL_WRITE_ATTEMPTS && self.running() => {
                    warn!(attempt, error = %e, "Physical write failed, retrying");
                    attempt += 1;
                    thread::sleep(WRITE_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record `frame` as awaiting acknowledgement, before it hits the wire.
    fn guard_frame(&self, frame: &[u8]) {
        let mut state = self.retransmit.lock();
        // A fresh write supersedes a resend of the previous frame.
        state.resend_pending = false;
        if !state.config.enabled || !is_control_packet(frame) {
            state.awaiting_ack = false;
            return;
        }
        state.retry_count = state.config.max_retries;
        state.frame = Some(frame.to_vec());
        state.awaiting_ack = true;
    }

    /// Arm the timer if the frame just written is still unanswered.
    fn arm_if_awaiting(&self) {
        let state = self.retransmit.lock();
        if state.awaiting_ack {
            self.timer
                .start(Duration::from_millis(state.config.interval_ms));
        }
    }

    fn cancel_retransmission(&self) {
        let mut state = self.retransmit.lock();
        state.awaiting_ack = false;
        state.resend_pending = false;
        state.frame = None;
        self.timer.stop();
    }

    fn on_retransmit_timeout(&self) {
        let mut state = self.retransmit.lock();
        if !state.awaiting_ack || !self.running() {
            return;
        }
        if state.retry_count == 0 {
            debug!("Retransmissions exhausted, leaving it to the caller's timeout");
            state.awaiting_ack = false;
            return;
        }
        state.retry_count -= 1;
        state.resend_pending = true;
        debug!(remaining = state.retry_count, "Retransmitting unacknowledged frame");
        drop(state);
        self.write_wake.post();
    }

    /// Frame the timer asked to resend, if any.
    fn take_resend(&self) -> Option<Vec<u8>> {
        let mut state = self.retransmit.lock();
        if !state.resend_pending {
            return None;
        }
        state.resend_pending = false;
        if state.awaiting_ack { state.frame.clone() } else { None }
    }
}

/// Delay before the next read attempt after `current` failed.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(READ_BACKOFF_CAP)
}

fn reader_loop(shared: Arc<Shared>) {
    debug!("Reader thread started");
    let mut backoff = READ_BACKOFF_BASE;
    let mut buf = vec![0u8; NCI_MAX_FRAME_SIZE];

    while shared.running() {
        shared.read_wake.wait();
        if !shared.running() {
            break;
        }

        let (generation, max_len) = {
            let slot = shared.read_slot.lock();
            if !slot.enabled {
                continue;
            }
            (slot.generation, slot.len)
        };

        if buf.len() < max_len {
            buf.resize(max_len, 0);
        }
        match shared.channel.read(&mut buf[..max_len]) {
            Ok(n) if n > 0 => {
                backoff = READ_BACKOFF_BASE;
                let frame = buf[..n].to_vec();
                trace!(len = n, data = %hex(&frame), "Frame read");

                if matches!(
                    message_type_of(&frame),
                    Some(MessageType::Response | MessageType::Notification)
                ) {
                    shared.cancel_retransmission();
                }

                let completion = {
                    let mut slot = shared.read_slot.lock();
                    if slot.generation != generation || !slot.enabled {
                        debug!(len = n, "Read aborted while in flight, frame dropped");
                        continue;
                    }
                    slot.enabled = false;
                    slot.completion.clone()
                };
                if let Some(completion) = completion {
                    shared.complete(
                        Direction::Read,
                        generation,
                        completion,
                        TransferStatus::Success,
                        frame,
                    );
                }
            }
            result => {
                if !shared.running() {
                    break;
                }
                match result {
                    Err(e) => warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "Physical read failed"),
                    Ok(_) => debug!("Empty read"),
                }
                thread::sleep(backoff);
                backoff = next_backoff(backoff);
                // Re-arm ourselves; the request stays pending.
                shared.read_wake.post();
            }
        }
    }
    debug!("Reader thread exiting");
}

fn writer_loop(shared: Arc<Shared>) {
    debug!("Writer thread started");

    while shared.running() {
        shared.write_wake.wait();
        if !shared.running() {
            break;
        }

        let fresh = {
            let mut slot = shared.write_slot.lock();
            if slot.enabled {
                slot.enabled = false;
                Some((slot.generation, slot.data.clone(), slot.completion.clone()))
            } else {
                None
            }
        };

        let Some((generation, data, completion)) = fresh else {
            if let Some(frame) = shared.take_resend() {
                match shared.write_physical(&frame) {
                    Ok(_) => trace!(data = %hex(&frame), "Frame retransmitted"),
                    Err(e) => warn!(error = %e, "Retransmission failed"),
                }
                shared.arm_if_awaiting();
            }
            continue;
        };

        shared.guard_frame(&data);
        let status = match shared.write_physical(&data) {
            Ok(n) => {
                trace!(len = n, data = %hex(&data), "Frame written");
                shared.arm_if_awaiting();
                TransferStatus::Success
            }
            Err(e) => {
                warn!(error = %e, len = data.len(), "Write failed after {} attempts", MAX_PHYSICAL_WRITE_ATTEMPTS);
                shared.cancel_retransmission();
                TransferStatus::Failed
            }
        };

        if let Some(completion) = completion {
            shared.complete(Direction::Write, generation, completion, status, data);
        }
    }
    debug!("Writer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MockChannel;
    use crate::dispatch::{CallbackTable, ClientDispatcher};
    use crossbeam_channel::{Receiver, unbounded};

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        mock: Arc<MockChannel>,
        transport: Transport,
        _dispatcher: ClientDispatcher,
    }

    fn harness(retransmit: RetransmitConfig) -> Harness {
        let mock = Arc::new(MockChannel::new());
        let dispatcher = ClientDispatcher::spawn(Arc::new(CallbackTable::new())).unwrap();
        let transport = Transport::open(
            mock.clone(),
            &LinkConfig::default(),
            retransmit,
            dispatcher.queue(),
        )
        .unwrap();
        Harness {
            mock,
            transport,
            _dispatcher: dispatcher,
        }
    }

    fn completion() -> (Arc<dyn TransferCompletion>, Receiver<(TransferStatus, Vec<u8>)>) {
        let (tx, rx) = unbounded();
        let cb: Arc<dyn TransferCompletion> = Arc::new(move |s: TransferStatus, d: &[u8]| {
            let _ = tx.send((s, d.to_vec()));
        });
        (cb, rx)
    }

    #[test]
    fn test_write_completes_on_dispatch_thread() {
        let h = harness(RetransmitConfig::default());
        let (cb, rx) = completion();
        h.transport.write(&CORE_RESET_CMD, cb).unwrap();
        let (status, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(status, TransferStatus::Success);
        assert_eq!(data, CORE_RESET_CMD.to_vec());
        assert_eq!(h.mock.count_writes(&CORE_RESET_CMD), 1);
    }

    #[test]
    fn test_second_write_while_busy_is_rejected() {
        let h = harness(RetransmitConfig::default());
        h.mock.fail_all_writes(true);
        let (cb, rx) = completion();
        h.transport.write(&CORE_RESET_CMD, cb.clone()).unwrap();
        assert!(matches!(
            h.transport.write(&CORE_INIT_CMD_V1, cb.clone()),
            Err(TransportError::Busy(Direction::Write))
        ));
        let (status, _) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(status, TransferStatus::Failed);
        // Slot is free again once the completion ran.
        h.mock.fail_all_writes(false);
        h.transport.write(&CORE_INIT_CMD_V1, cb).unwrap();
        assert_eq!(rx.recv_timeout(WAIT).unwrap().0, TransferStatus::Success);
    }

    #[test]
    fn test_concurrent_writers_never_overlap() {
        let h = harness(RetransmitConfig::default());
        let transport = Arc::new(h.transport);
        let accepted = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let transport = transport.clone();
            let accepted = accepted.clone();
            handles.push(thread::spawn(move || {
                let (cb, rx) = completion();
                match transport.write(&[0x00, 0x00, 0x01, i], cb) {
                    Ok(()) => {
                        accepted.fetch_add(1, Ordering::SeqCst);
                        rx.recv_timeout(WAIT).unwrap();
                    }
                    Err(TransportError::Busy(Direction::Write)) => {}
                    Err(e) => panic!("unexpected error {e}"),
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let accepted = accepted.load(Ordering::SeqCst) as usize;
        assert!(accepted >= 1);
        assert_eq!(h.mock.writes().len(), accepted);
    }

    #[test]
    fn test_write_and_wait() {
        let h = harness(RetransmitConfig::default());
        let status = h
            .transport
            .write_and_wait(&CORE_RESET_CMD, Duration::from_secs(1))
            .unwrap();
        assert_eq!(status, TransferStatus::Success);
        h.mock.fail_all_writes(true);
        let status = h
            .transport
            .write_and_wait(&CORE_RESET_CMD, Duration::from_secs(1))
            .unwrap();
        assert_eq!(status, TransferStatus::Failed);
    }

    #[test]
    fn test_invalid_requests() {
        let h = harness(RetransmitConfig::default());
        let (cb, _rx) = completion();
        assert!(matches!(
            h.transport.write(&[], cb.clone()),
            Err(TransportError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.transport.read(0, cb),
            Err(TransportError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_read_delivers_injected_frame() {
        let h = harness(RetransmitConfig::default());
        let (cb, rx) = completion();
        h.transport.read(NCI_MAX_FRAME_SIZE, cb.clone()).unwrap();
        assert!(matches!(
            h.transport.read(NCI_MAX_FRAME_SIZE, cb),
            Err(TransportError::Busy(Direction::Read))
        ));
        h.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        let (status, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(status, TransferStatus::Success);
        assert_eq!(data, vec![0x60, 0x07, 0x01, 0x03]);
        assert!(!h.transport.is_read_pending());
    }

    #[test]
    fn test_aborted_read_never_completes() {
        let h = harness(RetransmitConfig::default());
        let (cb, rx) = completion();
        h.transport.read(NCI_MAX_FRAME_SIZE, cb).unwrap();
        h.transport.read_abort();
        h.transport.read_abort();
        h.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert!(!h.transport.is_read_pending());
    }

    #[test]
    fn test_retransmission_bounded_by_max_retries() {
        let h = harness(RetransmitConfig {
            enabled: true,
            max_retries: 2,
            interval_ms: 20,
        });
        let (cb, rx) = completion();
        h.transport.write(&CORE_RESET_CMD, cb).unwrap();
        rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(h.mock.count_writes(&CORE_RESET_CMD), 3);
        assert_eq!(h.transport.physical_writes(), 3);
    }

    #[test]
    fn test_response_cancels_retransmission() {
        let h = harness(RetransmitConfig {
            enabled: true,
            max_retries: 3,
            interval_ms: 60,
        });
        let (read_cb, read_rx) = completion();
        h.transport.read(NCI_MAX_FRAME_SIZE, read_cb).unwrap();
        let (cb, rx) = completion();
        h.transport.write(&CORE_RESET_CMD, cb).unwrap();
        rx.recv_timeout(WAIT).unwrap();
        h.mock.inject(&[0x40, 0x00, 0x03, 0x00, 0x11, 0x01]);
        read_rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(250));
        assert_eq!(h.mock.count_writes(&CORE_RESET_CMD), 1);
    }

    #[test]
    fn test_data_packets_are_not_retransmitted() {
        let h = harness(RetransmitConfig {
            enabled: true,
            max_retries: 3,
            interval_ms: 20,
        });
        let (cb, rx) = completion();
        let data = [0x00, 0x00, 0x02, 0xCA, 0xFE];
        h.transport.write(&data, cb).unwrap();
        rx.recv_timeout(WAIT).unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(h.mock.count_writes(&data), 1);
    }

    #[test]
    fn test_fresh_write_goes_out_before_pending_resend() {
        let h = harness(RetransmitConfig {
            enabled: true,
            max_retries: 3,
            interval_ms: 10_000,
        });
        let (cb, rx) = completion();
        h.transport.write(&CORE_RESET_CMD, cb.clone()).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        // Timer fired but the writer has not picked the resend up yet.
        h.transport.shared.retransmit.lock().resend_pending = true;
        h.transport.write(&CORE_INIT_CMD_V1, cb).unwrap();
        rx.recv_timeout(WAIT).unwrap();

        assert_eq!(
            h.mock.writes(),
            vec![CORE_RESET_CMD.to_vec(), CORE_INIT_CMD_V1.to_vec()]
        );
        assert!(h.transport.shared.take_resend().is_none());
    }

    #[test]
    fn test_read_backoff_doubles_up_to_cap() {
        let mut backoff = READ_BACKOFF_BASE;
        let mut seen = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff);
            seen.push(backoff);
        }
        assert_eq!(seen[0], READ_BACKOFF_BASE * 2);
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*seen.last().unwrap(), READ_BACKOFF_CAP);
    }

    #[test]
    fn test_pending_read_survives_link_read_failures() {
        let h = harness(RetransmitConfig::default());
        h.mock.fail_next_reads(8);
        let (cb, rx) = completion();
        let started = std::time::Instant::now();
        h.transport.read(NCI_MAX_FRAME_SIZE, cb).unwrap();

        while h.mock.failed_reads() < 8 {
            assert!(started.elapsed() < WAIT, "reader stopped retrying");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(h.transport.is_read_pending());
        assert!(rx.try_recv().is_err());

        h.mock.inject(&[0x60, 0x07, 0x01, 0x03]);
        let (status, data) = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(status, TransferStatus::Success);
        assert_eq!(data, vec![0x60, 0x07, 0x01, 0x03]);
        // Eight failures under a capped back-off stay well below the uncapped sum.
        assert!(started.elapsed() < Duration::from_millis(1000));
    }

    #[test]
    fn test_shutdown_joins_threads_and_closes_link() {
        let h = harness(RetransmitConfig::default());
        let (cb, _rx) = completion();
        h.transport.read(NCI_MAX_FRAME_SIZE, cb.clone()).unwrap();
        h.transport.shutdown();
        assert!(!h.transport.is_running());
        assert!(!h.transport.has_threads());
        assert!(!h.mock.is_open());
        assert!(matches!(
            h.transport.write(&CORE_RESET_CMD, cb),
            Err(TransportError::InvalidParameter(_))
        ));
        h.transport.shutdown();
    }
}
