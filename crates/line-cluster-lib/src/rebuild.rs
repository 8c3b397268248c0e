//! Rebuild scheduling: trailing debounce for filter input and cancellable index builds
//!
//! Only the most recently *started* build may ever become active. Every build is tagged
//! with a generation number; results from older generations are dropped on arrival, and
//! starting a new build cancels the token of the one still running.

use crate::{ClusterError, ClusterIndex, ClusterOptions, Entity};
use instant::Instant;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Shared flag telling a running build to give up
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Trailing debouncer: holds the latest value until `delay` passes without a new one
#[derive(Debug, Clone)]
pub struct Debouncer<T> {
    delay: Duration,
    pending: Option<(T, Instant)>,
}

impl<T> Debouncer<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: None,
        }
    }

    /// Replace the pending value and restart the quiet period
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some((value, now + self.delay));
    }

    /// Take the pending value if its quiet period is over
    pub fn poll(&mut self, now: Instant) -> Option<T> {
        match &self.pending {
            Some((_, deadline)) if now >= *deadline => self.pending.take().map(|(v, _)| v),
            _ => None,
        }
    }

    /// Take the pending value regardless of the deadline
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|(v, _)| v)
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(_, d)| *d)
    }
}

/// Result of a finished build that is allowed to become active
#[derive(Debug)]
pub enum RebuildOutcome {
    Ready {
        generation: u64,
        /// Caller-supplied key describing the input set
        key: u64,
        index: ClusterIndex,
    },
    Failed {
        generation: u64,
        error: ClusterError,
    },
}

struct Completed {
    generation: u64,
    key: u64,
    result: crate::Result<ClusterIndex>,
}

/// Runs index builds inline or on the rayon pool and filters out superseded results
pub struct RebuildScheduler {
    background_threshold: usize,
    latest_started: u64,
    latest_finished: u64,
    in_flight: Option<CancellationToken>,
    tx: mpsc::Sender<Completed>,
    rx: mpsc::Receiver<Completed>,
}

impl std::fmt::Debug for RebuildScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RebuildScheduler")
            .field("background_threshold", &self.background_threshold)
            .field("latest_started", &self.latest_started)
            .field("latest_finished", &self.latest_finished)
            .finish()
    }
}

#[cfg_attr(feature = "profiling", profiling::all_functions)]
impl RebuildScheduler {
    /// Inputs with at least `background_threshold` entities build off the calling thread
    pub fn new(background_threshold: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            background_threshold,
            latest_started: 0,
            latest_finished: 0,
            in_flight: None,
            tx,
            rx,
        }
    }

    /// Start a build, superseding any build still running. Returns its generation.
    pub fn start(&mut self, entities: Vec<Arc<Entity>>, options: ClusterOptions, key: u64) -> u64 {
        if let Some(previous) = self.in_flight.take() {
            previous.cancel();
        }

        self.latest_started += 1;
        let generation = self.latest_started;
        let token = CancellationToken::new();
        let tx = self.tx.clone();

        if entities.len() >= self.background_threshold {
            tracing::debug!(
                "Starting background rebuild #{} over {} entities",
                generation,
                entities.len()
            );
            self.in_flight = Some(token.clone());
            rayon::spawn(move || {
                let result = ClusterIndex::build_cancellable(&entities, options, &token);
                // The receiver only disappears with the scheduler itself
                let _ = tx.send(Completed {
                    generation,
                    key,
                    result,
                });
            });
        } else {
            let result = ClusterIndex::build_cancellable(&entities, options, &token);
            let _ = tx.send(Completed {
                generation,
                key,
                result,
            });
        }

        generation
    }

    /// Drain finished builds, returning the result of the latest started one if it arrived
    pub fn poll(&mut self) -> Option<RebuildOutcome> {
        let mut outcome = None;
        while let Ok(completed) = self.rx.try_recv() {
            if let Some(o) = self.accept(completed) {
                outcome = Some(o);
            }
        }
        outcome
    }

    /// Block until the latest started build reports back or `timeout` elapses
    pub fn wait(&mut self, timeout: Duration) -> Option<RebuildOutcome> {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completed) => {
                    if let Some(o) = self.accept(completed) {
                        return Some(o);
                    }
                }
                Err(_) => return None,
            }
        }
        None
    }

    fn accept(&mut self, completed: Completed) -> Option<RebuildOutcome> {
        if completed.generation != self.latest_started {
            tracing::debug!(
                "Discarding result of superseded rebuild #{} (latest is #{})",
                completed.generation,
                self.latest_started
            );
            return None;
        }

        self.latest_finished = completed.generation;
        self.in_flight = None;
        match completed.result {
            Ok(index) => Some(RebuildOutcome::Ready {
                generation: completed.generation,
                key: completed.key,
                index,
            }),
            Err(error) => {
                tracing::warn!("Rebuild #{} failed: {}", completed.generation, error);
                Some(RebuildOutcome::Failed {
                    generation: completed.generation,
                    error,
                })
            }
        }
    }

    /// Abandon the running build; its result will be discarded on arrival
    pub fn cancel(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        self.latest_started += 1;
        self.latest_finished = self.latest_started;
        tracing::debug!("Rebuild cancelled, next generation is #{}", self.latest_started + 1);
    }

    /// Whether the latest started build has not reported back yet
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.latest_finished != self.latest_started
    }
}
