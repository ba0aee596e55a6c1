//! Pause and abort signalling between a controller and a running sweep
//!
//! A [`SweepControl`] is created for every run and handed to both sides. The controller sets the
//! flags at any time; the sweep only looks at them at its checkpoints and inside settle waits, so a
//! command in flight is never cut in half.

use std::{
    sync::{ Arc, atomic::{ AtomicBool, Ordering } },
    time::Duration,
};
use tokio::time::{ sleep, Instant };

/// Granularity of every interruptible wait
pub const POLL_TICK: Duration = Duration::from_millis(100);

/// What the sweep should do at a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint
{
    Continue,
    Abort,
}

/// The combined state of both flags. Abort wins over pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal
{
    Continue,
    Pause,
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct SweepControl
{
    pause_requested: Arc<AtomicBool>,
    abort_requested: Arc<AtomicBool>,
}

impl SweepControl
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn request_pause(&self)
    {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self)
    {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    pub fn request_abort(&self)
    {
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_pause_requested(&self) -> bool
    {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn is_abort_requested(&self) -> bool
    {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn signal(&self) -> Signal
    {
        if self.is_abort_requested() {
            Signal::Abort
        }
        else if self.is_pause_requested() {
            Signal::Pause
        }
        else {
            Signal::Continue
        }
    }

    /// Blocks for as long as a pause is requested
    ///
    /// `on_pause` is told `true` when the wait actually suspends and `false` when it is resumed,
    /// so the caller can publish the paused state. It is not called at all if no pause is pending,
    /// and an abort ends the pause without a `false`.
    pub async fn checkpoint<F>(&self, mut on_pause: F) -> Checkpoint
        where F: FnMut(bool)
    {
        match self.signal() {
            Signal::Continue => Checkpoint::Continue,
            Signal::Abort => Checkpoint::Abort,
            Signal::Pause => {
                on_pause(true);
                let outcome = self.wait_while_paused().await;
                if outcome == Checkpoint::Continue {
                    on_pause(false);
                }
                outcome
            },
        }
    }

    async fn wait_while_paused(&self) -> Checkpoint
    {
        loop {
            match self.signal() {
                Signal::Abort => return Checkpoint::Abort,
                Signal::Continue => return Checkpoint::Continue,
                Signal::Pause => sleep(POLL_TICK).await,
            }
        }
    }

    /// Waits `duration` in [`POLL_TICK`] increments
    ///
    /// An abort ends the wait at the next tick. A pause freezes the remaining time until resumed,
    /// so the settle period the device sees is never shortened by a pause.
    pub async fn settle<F>(&self, duration: Duration, mut on_pause: F) -> Checkpoint
        where F: FnMut(bool)
    {
        let mut remaining = duration;

        loop {
            match self.signal() {
                Signal::Abort => return Checkpoint::Abort,
                Signal::Pause => {
                    on_pause(true);
                    if self.wait_while_paused().await == Checkpoint::Abort {
                        return Checkpoint::Abort;
                    }
                    on_pause(false);
                },
                Signal::Continue => {
                    if remaining.is_zero() {
                        return Checkpoint::Continue;
                    }

                    let tick = remaining.min(POLL_TICK);
                    let started = Instant::now();
                    sleep(tick).await;
                    remaining = remaining.saturating_sub(started.elapsed().max(tick));
                },
            }
        }
    }
}
