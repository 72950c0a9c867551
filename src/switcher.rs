use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

use crate::appearance::ThemeController;
use crate::macos_bridge;
use crate::sensing::{AmbientLightSensor, Reading, SampleListener, SensorBackend, SensorError};
use crate::settings::Settings;
use crate::theme::{DecisionConfig, DecisionConfigError, Theme, ThemeDecisionEngine, ThemeIntent};

/// Switches applied on top of the decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelinePolicy {
    /// When false, intents are logged but the appearance is left alone.
    pub enabled: bool,
    /// Drop samples that would cause a transition while the lid is closed.
    pub skip_in_clamshell_mode: bool,
}

impl Default for PipelinePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            skip_in_clamshell_mode: true,
        }
    }
}

type LidCheck = Box<dyn Fn() -> bool + Send>;

fn system_lid_closed() -> bool {
    match macos_bridge::is_clamshell_closed() {
        Ok(closed) => closed,
        Err(err) => {
            debug!("Clamshell state unavailable, assuming open: {err:#}");
            false
        }
    }
}

/// State the pipeline shares with its owner. Read and written without
/// touching the sensor, so a slow read never stalls the owner.
struct PipelineShared {
    policy: watch::Sender<PipelinePolicy>,
    config: watch::Sender<DecisionConfig>,
    theme: watch::Sender<Theme>,
    intents: watch::Sender<Option<ThemeIntent>>,
}

/// Receives readings from the sensor, runs them through the engine and
/// applies the resulting intents.
pub struct DecisionPipeline<C: ThemeController> {
    engine: ThemeDecisionEngine,
    controller: C,
    lid_closed: LidCheck,
    shared: Arc<PipelineShared>,
    config_rx: watch::Receiver<DecisionConfig>,
}

impl<C: ThemeController> DecisionPipeline<C> {
    pub fn new(engine: ThemeDecisionEngine, controller: C, policy: PipelinePolicy) -> Self {
        let (config_tx, config_rx) = watch::channel(engine.config().clone());
        let shared = PipelineShared {
            policy: watch::channel(policy).0,
            config: config_tx,
            theme: watch::channel(engine.current_theme()).0,
            intents: watch::channel(None).0,
        };
        Self {
            engine,
            controller,
            lid_closed: Box::new(system_lid_closed),
            shared: Arc::new(shared),
            config_rx,
        }
    }

    /// Replace the clamshell check.
    pub fn with_lid_check(mut self, lid_closed: impl Fn() -> bool + Send + 'static) -> Self {
        self.lid_closed = Box::new(lid_closed);
        self
    }

    pub fn engine(&self) -> &ThemeDecisionEngine {
        &self.engine
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn policy(&self) -> PipelinePolicy {
        *self.shared.policy.borrow()
    }

    pub fn set_policy(&self, policy: PipelinePolicy) {
        self.shared.policy.send_replace(policy);
    }

    /// Watch the most recent committed intent.
    pub fn subscribe_intents(&self) -> watch::Receiver<Option<ThemeIntent>> {
        self.shared.intents.subscribe()
    }

    /// Pick up a config published by the owner since the last sample.
    fn refresh_config(&mut self) {
        if !self.config_rx.has_changed().unwrap_or(false) {
            return;
        }
        let config = self.config_rx.borrow_and_update().clone();
        match self.engine.set_config(config) {
            Ok(()) => info!("Decision thresholds updated: {:?}", self.engine.config()),
            Err(err) => warn!("Keeping previous decision thresholds: {err}"),
        }
    }

    fn apply(&mut self, intent: ThemeIntent) {
        self.shared.theme.send_replace(intent.theme);
        self.shared.intents.send_replace(Some(intent));

        if !self.policy().enabled {
            info!(
                "Automatic appearance switching disabled; not switching to {}",
                intent.theme
            );
            return;
        }

        if let Ok(current) = self.controller.current() {
            if current == intent.theme {
                debug!("System appearance already {}", intent.theme);
                return;
            }
        }

        match self.controller.apply(intent.theme) {
            Ok(()) => info!("Switched system appearance to {}", intent.theme),
            // The engine keeps its belief: the decision is about the light, not the call.
            Err(err) => error!("Failed to switch system appearance to {}: {err}", intent.theme),
        }
    }
}

impl<C: ThemeController> SampleListener for DecisionPipeline<C> {
    fn on_sample(&mut self, reading: Reading, at: Instant) {
        self.refresh_config();

        if self.policy().skip_in_clamshell_mode
            && self.engine.candidate(reading).is_some()
            && (self.lid_closed)()
        {
            debug!("Ignoring ambient light {reading} while the lid is closed");
            return;
        }

        if let Some(intent) = self.engine.on_sample(reading, at) {
            self.apply(intent);
        }
    }
}

/// Owns the sensor and its decision pipeline for the lifetime of the process.
pub struct AppearanceSwitcher<B: SensorBackend, C: ThemeController> {
    sensor: AmbientLightSensor<B, DecisionPipeline<C>>,
    shared: Arc<PipelineShared>,
}

impl<B: SensorBackend, C: ThemeController> AppearanceSwitcher<B, C> {
    pub fn new(backend: B, pipeline: DecisionPipeline<C>, update_interval: Duration) -> Self {
        let shared = Arc::clone(&pipeline.shared);
        Self {
            sensor: AmbientLightSensor::new(backend, pipeline, update_interval),
            shared,
        }
    }

    /// Start sampling. Fails with `NoSensorPresent` if the hardware vanished.
    pub async fn start(&mut self) -> Result<(), SensorError> {
        if !self.sensor.is_present().await {
            return Err(SensorError::NoSensorPresent);
        }

        let theme = self.current_theme();
        info!("Starting appearance switcher (believed appearance: {theme})");
        self.sensor.activate().await;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.sensor.is_active() {
            info!("Stopping appearance switcher");
        }
        self.sensor.invalidate();
    }

    pub fn is_running(&self) -> bool {
        self.sensor.is_active()
    }

    pub fn sensor(&self) -> &AmbientLightSensor<B, DecisionPipeline<C>> {
        &self.sensor
    }

    pub fn current_theme(&self) -> Theme {
        *self.shared.theme.borrow()
    }

    pub fn policy(&self) -> PipelinePolicy {
        *self.shared.policy.borrow()
    }

    pub fn set_policy(&self, policy: PipelinePolicy) {
        self.shared.policy.send_replace(policy);
    }

    /// Takes effect at the next sample.
    pub fn set_decision_config(&self, config: DecisionConfig) -> Result<(), DecisionConfigError> {
        config.validate()?;
        self.shared.config.send_replace(config);
        Ok(())
    }

    /// Push reloaded settings into the running pipeline and sensor.
    pub fn apply_settings(&self, settings: &Settings) -> Result<(), DecisionConfigError> {
        self.set_decision_config(settings.decision_config())?;
        self.set_policy(settings.pipeline_policy());
        self.sensor.set_update_interval(settings.update_interval());
        Ok(())
    }

    pub fn subscribe_intents(&self) -> watch::Receiver<Option<ThemeIntent>> {
        self.shared.intents.subscribe()
    }
}

impl<B: SensorBackend, C: ThemeController> Drop for AppearanceSwitcher<B, C> {
    fn drop(&mut self) {
        if self.sensor.is_active() {
            warn!("Appearance switcher dropped while running");
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    };

    use crate::appearance::ThemeApplyError;
    use crate::sensing::sensor::tests::ScriptedBackend;
    use crate::theme::DecisionConfig;

    /// Controller that records every call and can be told to refuse.
    #[derive(Clone, Default)]
    struct RecordingController {
        shown: Arc<Mutex<Option<Theme>>>,
        applied: Arc<Mutex<Vec<Theme>>>,
        refuse: bool,
    }

    impl RecordingController {
        fn showing(theme: Theme) -> Self {
            let controller = Self::default();
            *controller.shown.lock().unwrap() = Some(theme);
            controller
        }

        fn applied(&self) -> Vec<Theme> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl ThemeController for RecordingController {
        fn current(&self) -> Result<Theme, ThemeApplyError> {
            self.shown
                .lock()
                .unwrap()
                .ok_or(ThemeApplyError::Unsupported)
        }

        fn apply(&mut self, theme: Theme) -> Result<(), ThemeApplyError> {
            self.applied.lock().unwrap().push(theme);
            if self.refuse {
                return Err(ThemeApplyError::Rejected(theme));
            }
            *self.shown.lock().unwrap() = Some(theme);
            Ok(())
        }
    }

    fn config() -> DecisionConfig {
        DecisionConfig {
            low_threshold: 10.0,
            high_threshold: 40.0,
            min_dwell: Duration::from_secs(30),
        }
    }

    fn pipeline(
        controller: RecordingController,
        policy: PipelinePolicy,
    ) -> DecisionPipeline<RecordingController> {
        let initial = controller.current().unwrap_or_default();
        let engine = ThemeDecisionEngine::new(config(), initial).expect("valid config");
        DecisionPipeline::new(engine, controller, policy).with_lid_check(|| false)
    }

    #[test]
    fn committed_intent_is_applied_once() {
        let controller = RecordingController::showing(Theme::Light);
        let mut pipeline = pipeline(controller.clone(), PipelinePolicy::default());
        let base = Instant::now();

        pipeline.on_sample(Reading::new(2.0), base);
        pipeline.on_sample(Reading::new(1.0), base + Duration::from_secs(60));

        assert_eq!(controller.applied(), vec![Theme::Dark]);
        assert_eq!(pipeline.engine().current_theme(), Theme::Dark);
        assert_eq!(
            pipeline.subscribe_intents().borrow().map(|intent| intent.theme),
            Some(Theme::Dark)
        );
    }

    #[test]
    fn seeded_theme_prevents_correcting_intent() {
        let controller = RecordingController::showing(Theme::Dark);
        let mut pipeline = pipeline(controller.clone(), PipelinePolicy::default());

        pipeline.on_sample(Reading::new(2.0), Instant::now());

        assert!(controller.applied().is_empty());
        assert!(pipeline.subscribe_intents().borrow().is_none());
    }

    #[test]
    fn disabled_policy_keeps_belief_without_applying() {
        let controller = RecordingController::showing(Theme::Light);
        let policy = PipelinePolicy {
            enabled: false,
            ..PipelinePolicy::default()
        };
        let mut pipeline = pipeline(controller.clone(), policy);

        pipeline.on_sample(Reading::new(2.0), Instant::now());

        assert!(controller.applied().is_empty());
        assert_eq!(pipeline.engine().current_theme(), Theme::Dark);
    }

    #[test]
    fn system_already_showing_target_skips_call() {
        let controller = RecordingController::showing(Theme::Light);
        let mut pipeline = pipeline(controller.clone(), PipelinePolicy::default());
        // The user switched manually behind the engine's back.
        *controller.shown.lock().unwrap() = Some(Theme::Dark);

        pipeline.on_sample(Reading::new(2.0), Instant::now());

        assert!(controller.applied().is_empty());
        assert_eq!(pipeline.engine().current_theme(), Theme::Dark);
    }

    #[test]
    fn failed_apply_keeps_new_belief() {
        let controller = RecordingController {
            refuse: true,
            ..RecordingController::showing(Theme::Light)
        };
        let mut pipeline = pipeline(controller.clone(), PipelinePolicy::default());

        pipeline.on_sample(Reading::new(2.0), Instant::now());

        assert_eq!(controller.applied(), vec![Theme::Dark]);
        assert_eq!(pipeline.engine().current_theme(), Theme::Dark);
    }

    #[test]
    fn closed_lid_drops_transition_samples() {
        let controller = RecordingController::showing(Theme::Light);
        let lid_closed = Arc::new(AtomicBool::new(true));
        let lid = Arc::clone(&lid_closed);
        let mut pipeline = pipeline(controller.clone(), PipelinePolicy::default())
            .with_lid_check(move || lid.load(Ordering::SeqCst));
        let base = Instant::now();

        pipeline.on_sample(Reading::new(0.0), base);
        assert!(controller.applied().is_empty());
        assert_eq!(pipeline.engine().current_theme(), Theme::Light);
        assert_eq!(pipeline.engine().last_transition(), None);

        lid_closed.store(false, Ordering::SeqCst);
        pipeline.on_sample(Reading::new(0.0), base + Duration::from_secs(5));
        assert_eq!(controller.applied(), vec![Theme::Dark]);
    }

    #[test]
    fn closed_lid_ignored_when_policy_off() {
        let controller = RecordingController::showing(Theme::Light);
        let policy = PipelinePolicy {
            skip_in_clamshell_mode: false,
            ..PipelinePolicy::default()
        };
        let mut pipeline = pipeline(controller.clone(), policy).with_lid_check(|| true);

        pipeline.on_sample(Reading::new(0.0), Instant::now());
        assert_eq!(controller.applied(), vec![Theme::Dark]);
    }

    #[tokio::test(start_paused = true)]
    async fn switcher_drives_theme_from_sensor() {
        let controller = RecordingController::showing(Theme::Light);
        let backend = ScriptedBackend::new(vec![Ok(100.0), Ok(25.0), Ok(3.0)]);
        let mut switcher = AppearanceSwitcher::new(
            backend,
            pipeline(controller.clone(), PipelinePolicy::default()),
            Duration::from_secs(5),
        );
        let mut intents = switcher.subscribe_intents();

        switcher.start().await.expect("sensor present");
        assert!(switcher.is_running());
        assert_eq!(switcher.sensor().value(), Some(Reading::new(100.0)));

        intents.changed().await.expect("intent published");
        assert_eq!(switcher.current_theme(), Theme::Dark);
        assert_eq!(controller.applied(), vec![Theme::Dark]);
        assert_eq!(switcher.sensor().value(), Some(Reading::new(3.0)));

        switcher.stop();
        assert!(!switcher.is_running());
    }

    #[test]
    fn owner_calls_never_wait_for_the_sensor_core() {
        let controller = RecordingController::showing(Theme::Light);
        let switcher = AppearanceSwitcher::new(
            ScriptedBackend::constant(50.0),
            pipeline(controller, PipelinePolicy::default()),
            Duration::from_secs(5),
        );
        let quiet = PipelinePolicy {
            enabled: false,
            skip_in_clamshell_mode: false,
        };

        // Holding the core stands in for a slow hardware read; locking it
        // again from these calls would deadlock.
        switcher.sensor().with_listener(|_| {
            assert_eq!(switcher.current_theme(), Theme::Light);
            switcher.set_policy(quiet);
            switcher
                .set_decision_config(config())
                .expect("valid config");
            assert!(switcher.subscribe_intents().borrow().is_none());
        });

        assert_eq!(switcher.policy(), quiet);
        assert_eq!(switcher.sensor().with_listener(|pipeline| pipeline.policy()), quiet);
    }

    #[tokio::test]
    async fn reloaded_settings_take_effect_without_restart() {
        let controller = RecordingController::showing(Theme::Light);
        let backend = ScriptedBackend::new(vec![Ok(20.0), Ok(20.0), Ok(5.0)]);
        let switcher = AppearanceSwitcher::new(
            backend,
            pipeline(controller.clone(), PipelinePolicy::default()),
            Duration::from_secs(5),
        );

        // 20 lies inside the initial 10..40 band.
        switcher.sensor().update().await.expect("read");
        assert_eq!(switcher.current_theme(), Theme::Light);

        let settings = Settings {
            enabled: false,
            low_threshold: 25.0,
            high_threshold: 60.0,
            min_dwell_secs: 10,
            update_frequency: crate::sensing::UpdateFrequency::Slow,
            skip_in_clamshell_mode: false,
            ..Settings::default()
        };
        switcher.apply_settings(&settings).expect("valid settings");
        assert_eq!(switcher.sensor().update_interval(), Duration::from_secs(10));

        // Same reading, new band: Dark is committed but switching is off.
        switcher.sensor().update().await.expect("read");
        assert_eq!(switcher.current_theme(), Theme::Dark);
        assert!(controller.applied().is_empty());
        assert_eq!(
            switcher.sensor().with_listener(|pipeline| pipeline.engine().config().low_threshold),
            25.0
        );
    }

    #[test]
    fn invalid_reloaded_band_is_refused() {
        let controller = RecordingController::showing(Theme::Light);
        let switcher = AppearanceSwitcher::new(
            ScriptedBackend::constant(50.0),
            pipeline(controller, PipelinePolicy::default()),
            Duration::from_secs(5),
        );
        let inverted = DecisionConfig {
            low_threshold: 60.0,
            high_threshold: 20.0,
            min_dwell: Duration::from_secs(30),
        };

        assert!(switcher.set_decision_config(inverted).is_err());
        assert_eq!(
            switcher.sensor().with_listener(|pipeline| pipeline.engine().config().clone()),
            config()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hardware_failures_never_reach_the_engine() {
        let controller = RecordingController::showing(Theme::Light);
        let backend = ScriptedBackend::new(vec![
            Ok(50.0),
            Err(SensorError::unavailable("i/o")),
            Err(SensorError::unavailable("i/o")),
            Ok(50.0),
        ]);
        let switcher = AppearanceSwitcher::new(
            backend,
            pipeline(controller.clone(), PipelinePolicy::default()),
            Duration::from_secs(5),
        );

        for _ in 0..4 {
            let _ = switcher.sensor().update().await;
        }

        assert!(controller.applied().is_empty());
        assert_eq!(switcher.current_theme(), Theme::Light);
        assert_eq!(switcher.sensor().value(), Some(Reading::new(50.0)));
    }
}
