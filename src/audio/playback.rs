//! # Playback Scheduling
//!
//! Assigns gapless start times to agent audio frames on a monotonic output
//! clock and keeps the set of frames that are scheduled but not yet finished.
//! A flush (barge-in) discards that whole set in one step.
//!
//! ## Ownership:
//! The scheduler state lives inside one task and is only reached through
//! [`SchedulerHandle`] commands. Enqueue and flush are therefore serialized: a
//! flush is always observed before any frame enqueued after it.
//!
//! ## Timing rules:
//! - `start = max(now + safety_margin, cursor)`
//! - `end = start + frame duration`, then `cursor = end`
//! - while muted, frames are not scheduled at all
//! - an entry leaves the active set when its end time passes or on flush
//! - every flush starts a new epoch; entries carry the epoch they were
//!   scheduled in, so a caller can tell a reply that raced a flush from a live one

use crate::audio::frame::AudioFrame;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Lead time added before the first frame of a burst.
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_millis(20);

const COMMAND_CAPACITY: usize = 64;

/// The scheduler task is gone (session torn down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("playback scheduler has stopped")]
pub struct SchedulerStopped;

/// Monotonic clock that playback times are measured against.
#[derive(Debug, Clone, Copy)]
pub struct OutputClock {
    origin: Instant,
}

impl OutputClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Time elapsed since the clock started.
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    pub fn instant_at(&self, offset: Duration) -> Instant {
        self.origin + offset
    }
}

/// A frame that has been given a slot on the output clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackEntry {
    pub id: u64,
    pub seq: u64,
    /// Number of flushes that happened before this entry was scheduled
    pub epoch: u64,
    pub start: Duration,
    pub end: Duration,
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    /// Entries that were still pending and got discarded
    pub discarded: usize,
    /// The scheduler was already muted, so this flush changed nothing observable
    pub was_muted: bool,
    /// Epoch that starts with this flush; entries from earlier epochs are stale
    pub epoch: u64,
}

/// Point-in-time view of the scheduler, for diagnostics and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub active: usize,
    pub cursor: Option<Duration>,
    pub muted: bool,
    pub epoch: u64,
    pub scheduled: u64,
    pub completed: u64,
    pub flushed: u64,
}

struct FrameTiming {
    seq: u64,
    duration: Duration,
}

enum SchedulerCommand {
    Enqueue {
        frame: FrameTiming,
        reply: oneshot::Sender<Option<PlaybackEntry>>,
    },
    Flush {
        reply: oneshot::Sender<FlushOutcome>,
    },
    Unmute,
    Snapshot {
        reply: oneshot::Sender<SchedulerSnapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct PlaybackScheduler {
    clock: OutputClock,
    safety_margin: Duration,
    active: HashMap<u64, (PlaybackEntry, JoinHandle<()>)>,
    cursor: Option<Duration>,
    muted: bool,
    epoch: u64,
    next_id: u64,
    scheduled: u64,
    completed: u64,
    flushed: u64,
    completions: mpsc::UnboundedSender<u64>,
}

impl PlaybackScheduler {
    fn enqueue(&mut self, frame: FrameTiming) -> Option<PlaybackEntry> {
        if self.muted {
            trace!(seq = frame.seq, "Playback muted, frame not scheduled");
            return None;
        }

        let earliest = self.clock.now() + self.safety_margin;
        let start = match self.cursor {
            Some(cursor) if cursor > earliest => cursor,
            _ => earliest,
        };
        let end = start + frame.duration;
        self.cursor = Some(end);

        let id = self.next_id;
        self.next_id += 1;
        self.scheduled += 1;

        let entry = PlaybackEntry {
            id,
            seq: frame.seq,
            epoch: self.epoch,
            start,
            end,
        };

        let deadline = self.clock.instant_at(end);
        let completions = self.completions.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = completions.send(id);
        });
        self.active.insert(id, (entry, timer));

        Some(entry)
    }

    fn flush(&mut self) -> FlushOutcome {
        let discarded = self.active.len();
        for (_, (_, timer)) in self.active.drain() {
            timer.abort();
        }
        self.cursor = None;
        let was_muted = self.muted;
        self.muted = true;
        self.epoch += 1;
        self.flushed += discarded as u64;

        debug!(discarded, was_muted, epoch = self.epoch, "Playback flushed");
        FlushOutcome {
            discarded,
            was_muted,
            epoch: self.epoch,
        }
    }

    fn complete(&mut self, id: u64) {
        // Ids of flushed entries may still arrive; they are simply ignored.
        if self.active.remove(&id).is_some() {
            self.completed += 1;
        }
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            active: self.active.len(),
            cursor: self.cursor,
            muted: self.muted,
            epoch: self.epoch,
            scheduled: self.scheduled,
            completed: self.completed,
            flushed: self.flushed,
        }
    }

    fn shutdown(&mut self) {
        for (_, (_, timer)) in self.active.drain() {
            timer.abort();
        }
        self.cursor = None;
    }
}

/// Cloneable front end to a running scheduler task.
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
}

impl std::fmt::Debug for SchedulerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SchedulerCommand::Enqueue { .. } => "Enqueue",
            SchedulerCommand::Flush { .. } => "Flush",
            SchedulerCommand::Unmute => "Unmute",
            SchedulerCommand::Snapshot { .. } => "Snapshot",
            SchedulerCommand::Shutdown { .. } => "Shutdown",
        };
        f.write_str(name)
    }
}

impl SchedulerHandle {
    /// Start a scheduler task with its own output clock.
    pub fn spawn(safety_margin: Duration) -> (Self, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        let scheduler = PlaybackScheduler {
            clock: OutputClock::start(),
            safety_margin,
            active: HashMap::new(),
            cursor: None,
            muted: false,
            epoch: 0,
            next_id: 0,
            scheduled: 0,
            completed: 0,
            flushed: 0,
            completions: completion_tx,
        };

        let task = tokio::spawn(run_scheduler(scheduler, command_rx, completion_rx));
        (
            Self {
                commands: command_tx,
            },
            task,
        )
    }

    /// Schedule a frame. `Ok(None)` means playback is muted and the frame was dropped.
    pub async fn enqueue(&self, frame: &AudioFrame) -> Result<Option<PlaybackEntry>, SchedulerStopped> {
        let timing = FrameTiming {
            seq: frame.seq,
            duration: frame.duration(),
        };
        self.request(|reply| SchedulerCommand::Enqueue {
            frame: timing,
            reply,
        })
        .await
    }

    /// Discard every pending entry, reset the cursor and mute.
    pub async fn flush(&self) -> Result<FlushOutcome, SchedulerStopped> {
        self.request(|reply| SchedulerCommand::Flush { reply }).await
    }

    /// Accept frames again (a new response has started).
    pub async fn unmute(&self) -> Result<(), SchedulerStopped> {
        self.commands
            .send(SchedulerCommand::Unmute)
            .await
            .map_err(|_| SchedulerStopped)
    }

    pub async fn snapshot(&self) -> Result<SchedulerSnapshot, SchedulerStopped> {
        self.request(|reply| SchedulerCommand::Snapshot { reply }).await
    }

    /// Cancel everything outstanding and stop the task.
    pub async fn shutdown(&self) -> Result<(), SchedulerStopped> {
        self.request(|reply| SchedulerCommand::Shutdown { reply }).await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T, SchedulerStopped> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| SchedulerStopped)?;
        reply_rx.await.map_err(|_| SchedulerStopped)
    }
}

async fn run_scheduler(
    mut scheduler: PlaybackScheduler,
    mut commands: mpsc::Receiver<SchedulerCommand>,
    mut completions: mpsc::UnboundedReceiver<u64>,
) {
    loop {
        tokio::select! {
            biased;

            Some(id) = completions.recv() => scheduler.complete(id),

            command = commands.recv() => {
                let Some(command) = command else { break };
                match command {
                    SchedulerCommand::Enqueue { frame, reply } => {
                        let _ = reply.send(scheduler.enqueue(frame));
                    }
                    SchedulerCommand::Flush { reply } => {
                        let _ = reply.send(scheduler.flush());
                    }
                    SchedulerCommand::Unmute => {
                        scheduler.muted = false;
                    }
                    SchedulerCommand::Snapshot { reply } => {
                        let _ = reply.send(scheduler.snapshot());
                    }
                    SchedulerCommand::Shutdown { reply } => {
                        scheduler.shutdown();
                        let _ = reply.send(());
                        return;
                    }
                }
            }
        }
    }

    scheduler.shutdown();
}
