use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// A task whose timer elapsed and which passed the generation and expiry
/// checks. The payload is the value captured when the task was scheduled.
#[derive(Debug, Clone)]
pub struct FiredTask<K, P> {
    pub key: K,
    pub generation: u64,
    pub payload: P,
    pub fire_at: Instant,
    pub expires_at: Instant,
}

#[async_trait]
pub trait TaskHandler<K, P>: Send + Sync + 'static {
    async fn run(&self, task: FiredTask<K, P>) -> anyhow::Result<()>;

    /// Called instead of `run` when the task's expiry passed before it
    /// could fire. Nothing else will run for this generation.
    fn expired(&self, _key: &K, _generation: u64) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Executed,
    Failed(String),
    /// Superseded or cancelled after the timer elapsed.
    Stale,
    Expired,
}

/// Uniform delay range. `min == max` gives a fixed delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    min: Duration,
    max: Duration,
}

impl DelayRange {
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self::new(delay, delay)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn sample(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }
}

struct Slot {
    generation: u64,
    expires_at: Instant,
    timer: JoinHandle<()>,
}

enum Claim {
    Ready,
    Stale,
    Expired,
}

struct State<K> {
    next_generation: u64,
    tasks: HashMap<K, Slot>,
}

impl<K: Eq + Hash> State<K> {
    /// Decide whether the timer for `generation` may run. A live, matching
    /// slot is removed either way; a non-matching one is left alone.
    fn claim(&mut self, key: &K, generation: u64, now: Instant) -> Claim {
        match self.tasks.get(key) {
            Some(slot) if slot.generation == generation => {
                let expires_at = slot.expires_at;
                self.tasks.remove(key);
                if now > expires_at {
                    Claim::Expired
                } else {
                    Claim::Ready
                }
            }
            _ => Claim::Stale,
        }
    }
}

struct Inner<K, P> {
    name: &'static str,
    state: Mutex<State<K>>,
    handler: Arc<dyn TaskHandler<K, P>>,
}

/// Runs a handler for a keyed payload after a delay. At most one task is
/// pending per key: scheduling again for the same key replaces the pending
/// task, and the replaced one never runs.
pub struct DelayedTaskScheduler<K, P> {
    inner: Arc<Inner<K, P>>,
}

impl<K, P> Clone for DelayedTaskScheduler<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> DelayedTaskScheduler<K, P>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    P: Send + 'static,
{
    pub fn new(name: &'static str, handler: Arc<dyn TaskHandler<K, P>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name,
                state: Mutex::new(State {
                    next_generation: 0,
                    tasks: HashMap::new(),
                }),
                handler,
            }),
        }
    }

    /// Schedule `payload` to be handled `delay` from now, dropped if it
    /// cannot fire within `ttl` after that. Returns the task's generation.
    pub fn schedule(&self, key: K, payload: P, delay: Duration, ttl: Duration) -> u64 {
        let fire_at = Instant::now() + delay;
        let expires_at = fire_at + ttl;

        let mut state = self.inner.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        // The timer cannot claim before the slot is installed: claiming
        // needs the lock we are holding.
        let timer = tokio::spawn(Inner::run_timer(
            Arc::clone(&self.inner),
            key.clone(),
            generation,
            fire_at,
            expires_at,
            payload,
        ));

        let replaced = state.tasks.insert(
            key.clone(),
            Slot {
                generation,
                expires_at,
                timer,
            },
        );
        drop(state);

        match replaced {
            Some(previous) => {
                previous.timer.abort();
                debug!(
                    scheduler = self.inner.name,
                    key = %key,
                    superseded = previous.generation,
                    generation,
                    delay_ms = delay.as_millis() as u64,
                    "rescheduled task"
                );
            }
            None => {
                debug!(
                    scheduler = self.inner.name,
                    key = %key,
                    generation,
                    delay_ms = delay.as_millis() as u64,
                    "scheduled task"
                );
            }
        }

        generation
    }

    /// Cancel the pending task for `key`. Returns false if none was pending.
    pub fn cancel(&self, key: &K) -> bool {
        let removed = self.inner.state.lock().tasks.remove(key);
        match removed {
            Some(slot) => {
                slot.timer.abort();
                debug!(
                    scheduler = self.inner.name,
                    key = %key,
                    generation = slot.generation,
                    "cancelled task"
                );
                true
            }
            None => false,
        }
    }

    /// Cancel everything still pending. Used on shutdown.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<Slot> = {
            let mut state = self.inner.state.lock();
            state.tasks.drain().map(|(_, slot)| slot).collect()
        };
        for slot in &drained {
            slot.timer.abort();
        }
        if !drained.is_empty() {
            info!(
                scheduler = self.inner.name,
                dropped = drained.len(),
                "dropped pending tasks"
            );
        }
        drained.len()
    }

    /// Generation of the task currently pending for `key`.
    pub fn pending_generation(&self, key: &K) -> Option<u64> {
        self.inner.state.lock().tasks.get(key).map(|s| s.generation)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().tasks.len()
    }
}

impl<K, P> Inner<K, P>
where
    K: Clone + Eq + Hash + Display + Send + Sync + 'static,
    P: Send + 'static,
{
    async fn run_timer(
        self: Arc<Self>,
        key: K,
        generation: u64,
        fire_at: Instant,
        expires_at: Instant,
        payload: P,
    ) {
        tokio::time::sleep_until(fire_at).await;
        self.fire(FiredTask {
            key,
            generation,
            payload,
            fire_at,
            expires_at,
        })
        .await;
    }

    async fn fire(&self, task: FiredTask<K, P>) -> FireOutcome {
        let claim = self
            .state
            .lock()
            .claim(&task.key, task.generation, Instant::now());

        match claim {
            Claim::Stale => {
                debug!(
                    scheduler = self.name,
                    key = %task.key,
                    generation = task.generation,
                    "dropping superseded task"
                );
                return FireOutcome::Stale;
            }
            Claim::Expired => {
                debug!(
                    scheduler = self.name,
                    key = %task.key,
                    generation = task.generation,
                    "dropping expired task"
                );
                self.handler.expired(&task.key, task.generation);
                return FireOutcome::Expired;
            }
            Claim::Ready => {}
        }

        let key = task.key.clone();
        let generation = task.generation;
        let handler = Arc::clone(&self.handler);

        // A separate task so a panicking handler is reported, not fatal.
        let outcome = match tokio::spawn(async move { handler.run(task).await }).await {
            Ok(Ok(())) => FireOutcome::Executed,
            Ok(Err(e)) => FireOutcome::Failed(format!("{e:#}")),
            Err(e) => FireOutcome::Failed(format!("handler panicked: {e}")),
        };

        match &outcome {
            FireOutcome::Failed(reason) => error!(
                scheduler = self.name,
                key = %key,
                generation,
                error = %reason,
                "task handler failed"
            ),
            _ => debug!(scheduler = self.name, key = %key, generation, "task executed"),
        }
        outcome
    }
}
