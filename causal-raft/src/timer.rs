//! Named, resettable timers.
//!
//! Each owner (the Raft core, a replication stream) holds its own
//! `TimerService` whose fires are delivered into the owner's event queue,
//! so timer handlers serialize with message handling. Timers are one-shot:
//! a fire disarms the timer and the handler re-arms it as needed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// The timers the core schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerName {
    /// Follower/candidate election timeout.
    Election,
    /// Leader-side heartbeat tick.
    Heartbeat,
    /// Coalesces appended entries into one replication batch.
    AppendBatch,
}

/// Delivered into the owner's queue when a timer fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerFired {
    pub name: TimerName,
}

#[derive(Debug, Clone)]
struct Armed {
    generation: u64,
    delay: Duration,
    jitter: Duration,
}

/// See the module docs.
pub struct TimerService {
    state: Arc<Mutex<HashMap<TimerName, Armed>>>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl TimerService {
    /// Create a service together with the receiver its fires arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                state: Arc::new(Mutex::new(HashMap::new())),
                tx,
            },
            rx,
        )
    }

    /// Arm `name` to fire once after `delay` plus a uniformly random
    /// share of `jitter`.
    pub fn set(&self, name: TimerName, delay: Duration, jitter: Duration) {
        let generation = {
            let mut state = self.state.lock().unwrap();
            let armed = state.entry(name).or_insert(Armed {
                generation: 0,
                delay,
                jitter,
            });
            armed.generation += 1;
            armed.delay = delay;
            armed.jitter = jitter;
            armed.generation
        };
        self.spawn_fire(name, generation, delay, jitter);
    }

    /// Re-arm `name` with its configured delay and jitter, invalidating
    /// any pending fire.
    pub fn reset(&self, name: TimerName) {
        let armed = {
            let mut state = self.state.lock().unwrap();
            match state.get_mut(&name) {
                Some(armed) => {
                    armed.generation += 1;
                    armed.clone()
                }
                None => return,
            }
        };
        self.spawn_fire(name, armed.generation, armed.delay, armed.jitter);
    }

    /// Disarm `name`; a pending fire is dropped.
    pub fn cancel(&self, name: TimerName) {
        let mut state = self.state.lock().unwrap();
        state.remove(&name);
    }

    fn spawn_fire(&self, name: TimerName, generation: u64, delay: Duration, jitter: Duration) {
        let total = delay + random_share(jitter);
        let state = self.state.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            sleep(total).await;
            let fire = {
                let mut state = state.lock().unwrap();
                match state.get(&name) {
                    // A stale generation means the timer was reset or
                    // re-armed since this sleep began.
                    Some(armed) if armed.generation == generation => {
                        state.remove(&name);
                        true
                    }
                    _ => false,
                }
            };
            if fire {
                let _ = tx.send(TimerFired { name });
            }
        });
    }
}

fn random_share(jitter: Duration) -> Duration {
    let ms = jitter.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn armed_timer_fires_once() {
        let (timers, mut rx) = TimerService::new();
        timers.set(TimerName::Election, Duration::from_millis(10), Duration::ZERO);

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("timer did not fire")
            .unwrap();
        assert_eq!(fired.name, TimerName::Election);

        // One-shot: nothing further arrives.
        let silent = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn reset_postpones_the_fire() {
        let (timers, mut rx) = TimerService::new();
        timers.set(TimerName::Heartbeat, Duration::from_millis(40), Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(20)).await;
        timers.reset(TimerName::Heartbeat);

        // The original fire would land around t=40; after the reset the
        // earliest fire lands around t=60.
        let early = tokio::time::timeout(Duration::from_millis(25), rx.recv()).await;
        assert!(early.is_err());

        let fired = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .expect("reset timer did not fire")
            .unwrap();
        assert_eq!(fired.name, TimerName::Heartbeat);
    }

    #[tokio::test]
    async fn cancelled_timer_does_not_fire() {
        let (timers, mut rx) = TimerService::new();
        timers.set(TimerName::AppendBatch, Duration::from_millis(10), Duration::ZERO);
        timers.cancel(TimerName::AppendBatch);

        let silent = tokio::time::timeout(Duration::from_millis(60), rx.recv()).await;
        assert!(silent.is_err());
    }
}
