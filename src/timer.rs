//! Cancellable periodic timers backing the role controller.
//!
//! Each timer owns one worker thread, reconfigured over a channel. Arming replaces any
//! previous schedule, so re-arming doubles as a deadline reset; disarming parks the
//! worker until the next arm. The tick callback runs on the worker thread and the next
//! period is measured from its return, so a tick that blocks (an election, a replication
//! pass) delays the following firing instead of stacking.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

enum Command {
    Arm { first: Duration, period: Duration },
    Disarm,
}

pub(crate) struct Timer {
    commands: Sender<Command>,
}

impl Timer {
    /// Spawns the worker thread; `tick` runs on it at every firing. The worker exits
    /// when the owning timer is dropped.
    pub fn spawn(name: &str, tick: impl Fn() + Send + 'static) -> Self {
        let (commands, receiver) = unbounded();
        thread::Builder::new()
            .name(format!("raft-{}-timer", name))
            .spawn(move || Self::work(receiver, tick))
            .expect("failed to spawn timer thread");
        Self { commands }
    }

    /// Schedules the first firing after `first`, then one every `period`.
    pub fn arm(&self, first: Duration, period: Duration) {
        let _ = self.commands.send(Command::Arm { first, period });
    }

    pub fn disarm(&self) {
        let _ = self.commands.send(Command::Disarm);
    }

    fn work(receiver: Receiver<Command>, tick: impl Fn()) {
        let mut schedule: Option<(Instant, Duration)> = None;
        loop {
            let command = match schedule {
                None => match receiver.recv() {
                    Ok(command) => Some(command),
                    Err(_) => return,
                },
                Some((deadline, period)) => match receiver.recv_deadline(deadline) {
                    Ok(command) => Some(command),
                    Err(RecvTimeoutError::Timeout) => {
                        tick();
                        schedule = Some((Instant::now() + period, period));
                        None
                    }
                    Err(RecvTimeoutError::Disconnected) => return,
                },
            };
            match command {
                Some(Command::Arm { first, period }) => {
                    schedule = Some((Instant::now() + first, period));
                }
                Some(Command::Disarm) => schedule = None,
                None => (),
            }
        }
    }
}
