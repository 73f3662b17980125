//! Blocking primitives shared by the transport threads.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{debug, error};

/// Counting semaphore built on a channel of unit tokens.
#[derive(Clone)]
pub struct Semaphore {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Semaphore {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    pub fn post(&self) {
        // Both ends live in self, so the channel never disconnects.
        let _ = self.tx.send(());
    }

    pub fn wait(&self) {
        let _ = self.rx.recv();
    }

    /// Returns false if the timeout elapsed first.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.rx.recv_timeout(timeout).is_ok()
    }

    /// Discard pending posts.
    pub fn drain(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// Join `handle`, giving up after `timeout`.
///
/// Threads cannot be cancelled; one that misses the deadline is detached
/// and keeps running until its blocking call returns.
pub fn join_with_timeout(handle: JoinHandle<()>, name: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            error!(thread = name, timeout_ms = timeout.as_millis() as u64, "Thread did not exit, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        error!(thread = name, "Thread panicked");
        return false;
    }
    debug!(thread = name, "Thread joined");
    true
}
