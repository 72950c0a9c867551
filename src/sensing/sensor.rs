use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, TryLockError,
};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::backend::{Reading, SensorBackend, SensorError};
use super::loop_worker::sampling_loop;

/// Receives every successfully stored reading, in order, on the sampling context.
pub trait SampleListener: Send + 'static {
    fn on_sample(&mut self, reading: Reading, at: Instant);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateFrequency {
    Realtime,
    Fast,
    Slow,
}

impl Default for UpdateFrequency {
    fn default() -> Self {
        UpdateFrequency::Fast
    }
}

impl UpdateFrequency {
    pub fn interval(&self) -> Duration {
        match self {
            UpdateFrequency::Realtime => Duration::from_millis(100),
            UpdateFrequency::Fast => Duration::from_secs(5),
            UpdateFrequency::Slow => Duration::from_secs(10),
        }
    }
}

struct SensorCore<B, L> {
    backend: B,
    listener: L,
    /// Consecutive failed reads, for log throttling.
    failure_streak: u32,
}

/// What happened to one sample.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SampleOutcome {
    Stored(Reading),
    Failed(SensorError),
    /// The sensor was invalidated while the read was in flight.
    Discarded,
}

/// State shared between the sensor handle and its sampling task.
pub(crate) struct SamplingTask<B, L> {
    core: Arc<Mutex<SensorCore<B, L>>>,
    value_tx: Arc<watch::Sender<Option<Reading>>>,
    interval_ms: Arc<AtomicU64>,
    epoch: Arc<AtomicU64>,
    release_pending: Arc<AtomicBool>,
}

impl<B, L> Clone for SamplingTask<B, L> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            value_tx: Arc::clone(&self.value_tx),
            interval_ms: Arc::clone(&self.interval_ms),
            epoch: Arc::clone(&self.epoch),
            release_pending: Arc::clone(&self.release_pending),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: SensorBackend, L: SampleListener> SamplingTask<B, L> {
    pub(crate) fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::SeqCst))
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// Read once on the blocking pool. With `expected_epoch` set, the result is
    /// discarded if the sensor was invalidated meanwhile.
    pub(crate) async fn sample(&self, expected_epoch: Option<u64>) -> SampleOutcome {
        let task = self.clone();
        match tokio::task::spawn_blocking(move || task.sample_blocking(expected_epoch)).await {
            Ok(outcome) => outcome,
            Err(err) => SampleOutcome::Failed(SensorError::unavailable(format!(
                "sensor read task failed: {err}"
            ))),
        }
    }

    /// Run `f` with the core locked, then finish any release that
    /// `invalidate` could not perform while the core was busy.
    fn with_core<R>(&self, f: impl FnOnce(&mut SensorCore<B, L>) -> R) -> R {
        let result = f(&mut lock(&self.core));
        self.settle_release();
        result
    }

    /// Whoever leaves the core last with a release pending performs it.
    fn settle_release(&self) {
        while self.release_pending.load(Ordering::SeqCst) {
            let mut core = match self.core.try_lock() {
                Ok(core) => core,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // The current holder settles on its way out.
                Err(TryLockError::WouldBlock) => return,
            };
            if self.release_pending.swap(false, Ordering::SeqCst) {
                core.backend.release();
            }
        }
    }

    fn is_stale(&self, expected_epoch: Option<u64>) -> bool {
        expected_epoch.is_some_and(|epoch| epoch != self.epoch())
    }

    fn sample_blocking(&self, expected_epoch: Option<u64>) -> SampleOutcome {
        self.with_core(|core| {
            // Invalidated while queued: reading now would reopen the hardware.
            if self.is_stale(expected_epoch) {
                core.backend.release();
                return SampleOutcome::Discarded;
            }

            let result = core.backend.read();
            let at = Instant::now();

            if self.is_stale(expected_epoch) {
                debug!("Discarding ambient light read finished after invalidate");
                core.backend.release();
                return SampleOutcome::Discarded;
            }

            match result {
                Ok(reading) => {
                    if core.failure_streak > 0 {
                        info!(
                            "Ambient light sensor recovered after {} failed reads",
                            core.failure_streak
                        );
                        core.failure_streak = 0;
                    }
                    self.value_tx.send_replace(Some(reading));
                    core.listener.on_sample(reading, at);
                    SampleOutcome::Stored(reading)
                }
                Err(err) => {
                    core.failure_streak = core.failure_streak.saturating_add(1);
                    if core.failure_streak == 1 {
                        warn!("Ambient light read failed: {err}");
                    } else {
                        debug!(
                            "Ambient light read failed ({} in a row): {err}",
                            core.failure_streak
                        );
                    }
                    SampleOutcome::Failed(err)
                }
            }
        })
    }
}

/// Periodically samples a [`SensorBackend`] and forwards readings to a
/// [`SampleListener`].
///
/// The owner must call [`invalidate`](Self::invalidate) before dropping an
/// active sensor.
pub struct AmbientLightSensor<B: SensorBackend, L: SampleListener> {
    task: SamplingTask<B, L>,
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl<B: SensorBackend, L: SampleListener> AmbientLightSensor<B, L> {
    pub fn new(backend: B, listener: L, update_interval: Duration) -> Self {
        let (value_tx, _) = watch::channel(None);
        Self {
            task: SamplingTask {
                core: Arc::new(Mutex::new(SensorCore {
                    backend,
                    listener,
                    failure_streak: 0,
                })),
                value_tx: Arc::new(value_tx),
                interval_ms: Arc::new(AtomicU64::new(interval_to_ms(update_interval))),
                epoch: Arc::new(AtomicU64::new(0)),
                release_pending: Arc::new(AtomicBool::new(false)),
            },
            handle: None,
            cancel_token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel_token.is_some()
    }

    /// Sample once right away, then keep sampling every `update_interval`.
    /// Calling it on an active sensor does nothing.
    pub async fn activate(&mut self) {
        if self.is_active() {
            debug!("Ambient light sensor already active");
            return;
        }

        let epoch = self.task.epoch();
        self.task.sample(Some(epoch)).await;

        info!(
            "Ambient light sensor active (interval {:?})",
            self.task.interval()
        );
        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(sampling_loop(
            self.task.clone(),
            epoch,
            cancel_token.clone(),
        ));
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
    }

    /// Stop sampling and release the hardware. Never waits for a read in
    /// flight; that read's result is dropped and it releases the hardware
    /// itself when done. Calling it on an inactive sensor does nothing.
    pub fn invalidate(&mut self) {
        let Some(cancel_token) = self.cancel_token.take() else {
            return;
        };

        cancel_token.cancel();
        self.task.epoch.fetch_add(1, Ordering::SeqCst);
        // Detach; the loop observes the cancellation on its own.
        self.handle.take();

        // Request first so a reader that holds the core sees it on the way out.
        self.task.release_pending.store(true, Ordering::SeqCst);
        let core = match self.task.core.try_lock() {
            Ok(core) => Some(core),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut core) = core {
            if self.task.release_pending.swap(false, Ordering::SeqCst) {
                core.backend.release();
            }
        }

        info!("Ambient light sensor invalidated");
    }

    /// Take one sample now, regardless of the timer.
    pub async fn update(&self) -> Result<Reading, SensorError> {
        match self.task.sample(None).await {
            SampleOutcome::Stored(reading) => Ok(reading),
            SampleOutcome::Failed(err) => Err(err),
            SampleOutcome::Discarded => Err(SensorError::unavailable("read discarded")),
        }
    }

    /// Last stored reading; `None` until a read succeeds.
    pub fn value(&self) -> Option<Reading> {
        *self.task.value_tx.borrow()
    }

    /// Watch stored readings as they arrive.
    pub fn subscribe(&self) -> watch::Receiver<Option<Reading>> {
        self.task.value_tx.subscribe()
    }

    pub fn update_interval(&self) -> Duration {
        self.task.interval()
    }

    /// Takes effect at the next tick of a running timer.
    pub fn set_update_interval(&self, interval: Duration) {
        self.task
            .interval_ms
            .store(interval_to_ms(interval), Ordering::SeqCst);
    }

    /// Whether the backend's hardware exists. Runs on the blocking pool since
    /// it waits for a read in flight.
    pub async fn is_present(&self) -> bool {
        let task = self.task.clone();
        tokio::task::spawn_blocking(move || task.with_core(|core| core.backend.is_present()))
            .await
            .unwrap_or(false)
    }

    /// Run `f` against the listener, serialized with sampling. Blocks while a
    /// read is in flight, so async callers should not use it.
    pub fn with_listener<R>(&self, f: impl FnOnce(&mut L) -> R) -> R {
        self.task.with_core(|core| f(&mut core.listener))
    }
}

impl<B: SensorBackend, L: SampleListener> Drop for AmbientLightSensor<B, L> {
    fn drop(&mut self) {
        if self.is_active() {
            warn!("Ambient light sensor dropped while active; invalidating");
            self.invalidate();
        }
    }
}

fn interval_to_ms(interval: Duration) -> u64 {
    u64::try_from(interval.as_millis())
        .unwrap_or(u64::MAX)
        .max(1)
}
