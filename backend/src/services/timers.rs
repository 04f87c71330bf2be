//! In-process timer registry keyed by `(session, kind)`.
//!
//! Arming a key replaces whatever was armed under it before. Cancelling is
//! idempotent. A handler that has already started is never interrupted by a
//! cancel; it is expected to re-check session state itself.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::models::party::Role;
use crate::types::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    RequestTimeout,
    Billing,
    TrialExpiry,
    DisconnectGrace(Role),
}

/// What a recurring handler wants after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickControl {
    Continue,
    Stop,
}

struct Slot {
    generation: u64,
    token: CancellationToken,
}

#[derive(Default)]
pub struct TimerRegistry {
    slots: Mutex<HashMap<(SessionId, TimerKind), Slot>>,
    generation: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn arm(&self, session_id: SessionId, kind: TimerKind) -> (u64, CancellationToken) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let previous = self.slots.lock().insert(
            (session_id, kind),
            Slot {
                generation,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.token.cancel();
        }
        (generation, token)
    }

    /// Drops the slot only if it still belongs to the timer that is finishing.
    fn release(&self, session_id: SessionId, kind: TimerKind, generation: u64) {
        let mut slots = self.slots.lock();
        if slots
            .get(&(session_id, kind))
            .is_some_and(|slot| slot.generation == generation)
        {
            slots.remove(&(session_id, kind));
        }
    }

    pub fn cancel(&self, session_id: SessionId, kind: TimerKind) -> bool {
        match self.slots.lock().remove(&(session_id, kind)) {
            Some(slot) => {
                slot.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer armed for the session. Returns how many were live.
    pub fn cancel_all(&self, session_id: SessionId) -> usize {
        let removed: Vec<Slot> = {
            let mut slots = self.slots.lock();
            let keys: Vec<_> = slots
                .keys()
                .filter(|(id, _)| *id == session_id)
                .copied()
                .collect();
            keys.into_iter().filter_map(|key| slots.remove(&key)).collect()
        };
        for slot in &removed {
            slot.token.cancel();
        }
        removed.len()
    }

    pub fn is_armed(&self, session_id: SessionId, kind: TimerKind) -> bool {
        self.slots.lock().contains_key(&(session_id, kind))
    }

    pub fn armed_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Runs `handler` once after `delay` unless cancelled first.
    pub fn schedule_once<F, Fut>(
        self: &Arc<Self>,
        session_id: SessionId,
        kind: TimerKind,
        delay: Duration,
        handler: F,
    ) where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (generation, token) = self.arm(session_id, kind);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            registry.release(session_id, kind, generation);
            handler().await;
        });
    }

    /// Runs `tick` after `first_delay` and then every `period` until it
    /// returns [`TickControl::Stop`] or the timer is cancelled. Each tick is
    /// awaited before the next one is scheduled.
    pub fn schedule_every<F, Fut>(
        self: &Arc<Self>,
        session_id: SessionId,
        kind: TimerKind,
        first_delay: Duration,
        period: Duration,
        mut tick: F,
    ) where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TickControl> + Send + 'static,
    {
        let (generation, token) = self.arm(session_id, kind);
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + first_delay, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {}
                }
                if tick().await == TickControl::Stop {
                    break;
                }
                if token.is_cancelled() {
                    return;
                }
            }
            registry.release(session_id, kind, generation);
        });
    }
}
