//! Single-shot restartable timer running on its own thread.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use tracing::trace;

#[derive(Debug)]
enum TimerCommand {
    Start(Duration),
    Stop,
    Shutdown,
}

/// Handle used to arm and cancel the timer.
#[derive(Clone)]
pub struct Timer {
    tx: Sender<TimerCommand>,
}

/// Thread side of a timer; spawned once its expiry action is known.
pub struct TimerRunner {
    rx: Receiver<TimerCommand>,
}

impl Timer {
    pub fn new() -> (Timer, TimerRunner) {
        let (tx, rx) = unbounded();
        (Timer { tx }, TimerRunner { rx })
    }

    /// Arm (or re-arm) the timer to fire once after `after`.
    pub fn start(&self, after: Duration) {
        let _ = self.tx.send(TimerCommand::Start(after));
    }

    /// Cancel a pending expiry. No-op if not armed.
    pub fn stop(&self) {
        let _ = self.tx.send(TimerCommand::Stop);
    }

    /// Terminate the timer thread.
    pub fn shutdown(&self) {
        let _ = self.tx.send(TimerCommand::Shutdown);
    }
}

impl TimerRunner {
    pub fn spawn<F>(self, name: &str, on_expiry: F) -> io::Result<JoinHandle<()>>
    where
        F: Fn() + Send + 'static,
    {
        let label = name.to_string();
        thread::Builder::new()
            .name(label.clone())
            .spawn(move || self.run(&label, on_expiry))
    }

    fn run<F: Fn()>(self, name: &str, on_expiry: F) {
        let mut deadline: Option<Instant> = None;
        loop {
            let command = match deadline {
                Some(at) => match self.rx.recv_deadline(at) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        deadline = None;
                        trace!(timer = name, "Timer expired");
                        on_expiry();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(cmd) => cmd,
                    Err(_) => break,
                },
            };
            match command {
                TimerCommand::Start(after) => deadline = Some(Instant::now() + after),
                TimerCommand::Stop => deadline = None,
                TimerCommand::Shutdown => break,
            }
        }
        trace!(timer = name, "Timer thread exiting");
    }
}
