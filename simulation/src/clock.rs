//! Logical clock and pause gate
//!
//! The clock only moves when the driver calls [`Clock::advance`], and
//! never while paused. Pausing and advancing share one lock, so once
//! `pause()` returns no later tick can be observed until `resume()`.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::MessageBus;

#[derive(Debug)]
struct ClockState {
    tick: u64,
    paused: bool,
}

/// Shared logical clock with a global pause gate
#[derive(Debug)]
pub struct Clock {
    state: Mutex<ClockState>,
    ticks: watch::Sender<u64>,
    open: watch::Sender<bool>,
}

impl Clock {
    pub fn new() -> Self {
        let (ticks, _) = watch::channel(0);
        let (open, _) = watch::channel(true);
        Self {
            state: Mutex::new(ClockState {
                tick: 0,
                paused: false,
            }),
            ticks,
            open,
        }
    }

    /// Current tick
    pub fn now(&self) -> u64 {
        self.state.lock().tick
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    /// Close the gate and freeze the clock. Returns false if already paused.
    pub fn pause(&self) -> bool {
        let mut state = self.state.lock();
        if state.paused {
            return false;
        }
        state.paused = true;
        self.open.send_replace(false);
        true
    }

    /// Reopen the gate and let the clock run. Returns false if not paused.
    pub fn resume(&self) -> bool {
        let mut state = self.state.lock();
        if !state.paused {
            return false;
        }
        state.paused = false;
        self.open.send_replace(true);
        true
    }

    /// Move to the next tick unless paused
    pub fn advance(&self) -> Option<u64> {
        let mut state = self.state.lock();
        if state.paused {
            return None;
        }
        state.tick += 1;
        self.ticks.send_replace(state.tick);
        Some(state.tick)
    }

    /// Receiver notified on every tick
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.ticks.subscribe()
    }

    pub fn gate(&self) -> Gate {
        Gate {
            open: self.open.subscribe(),
        }
    }

    /// Resolve once the clock reaches `tick`
    pub async fn wait_until(&self, tick: u64) {
        let mut rx = self.subscribe();
        // The sender lives as long as the clock
        let _ = rx.wait_for(|now| *now >= tick).await;
    }

    /// Resolve after `ticks` more ticks
    pub async fn wait_ticks(&self, ticks: u64) {
        let target = self.now().saturating_add(ticks);
        self.wait_until(target).await;
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of the pause gate
#[derive(Debug, Clone)]
pub struct Gate {
    open: watch::Receiver<bool>,
}

impl Gate {
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolve when the gate is open
    pub async fn wait_open(&mut self) {
        let _ = self.open.wait_for(|open| *open).await;
    }
}

/// Spawn the task that advances the clock and releases due messages
pub fn spawn_driver(
    clock: Arc<Clock>,
    bus: Arc<MessageBus>,
    interval: std::time::Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Clock driver started");
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick of a tokio interval fires immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!(tick = clock.now(), "Clock driver shutting down");
                    break;
                }
                _ = timer.tick() => {
                    if let Some(tick) = clock.advance() {
                        let released = bus.deliver_due(tick);
                        if released > 0 {
                            debug!(tick, released, "Released due messages");
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_advance_while_paused() {
        let clock = Clock::new();
        assert_eq!(clock.advance(), Some(1));
        assert!(clock.pause());
        assert!(!clock.pause());
        assert_eq!(clock.advance(), None);
        assert_eq!(clock.now(), 1);
        assert!(clock.resume());
        assert!(!clock.resume());
        assert_eq!(clock.advance(), Some(2));
    }

    #[tokio::test]
    async fn test_gate_follows_pause() {
        let clock = Clock::new();
        let mut gate = clock.gate();
        assert!(gate.is_open());
        clock.pause();
        assert!(!gate.is_open());

        let waiter = tokio::spawn(async move {
            gate.wait_open().await;
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        clock.resume();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until() {
        let clock = Arc::new(Clock::new());
        let waiting = {
            let clock = clock.clone();
            tokio::spawn(async move { clock.wait_until(3).await })
        };
        for _ in 0..3 {
            tokio::task::yield_now().await;
            clock.advance();
        }
        waiting.await.unwrap();
        assert_eq!(clock.now(), 3);
    }

    #[test]
    fn test_wait_ticks_pending_while_paused() {
        let clock = Clock::new();
        let mut wait = tokio_test::task::spawn(clock.wait_ticks(2));
        tokio_test::assert_pending!(wait.poll());

        clock.advance();
        clock.pause();
        assert_eq!(clock.advance(), None);
        tokio_test::assert_pending!(wait.poll());

        clock.resume();
        clock.advance();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());
    }
}
