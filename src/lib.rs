pub mod appearance;
mod macos_bridge;
pub mod sensing;
pub mod settings;
pub mod switcher;
pub mod theme;
mod utils;

use anyhow::{Context, Result};
use log::{error, info, warn};

use appearance::{SystemAppearance, ThemeController};
use sensing::{Backend, SensorBackend, SensorCapability, SensorError, UpdateFrequency};
use settings::SettingsStore;
use switcher::{AppearanceSwitcher, DecisionPipeline};
use theme::{Theme, ThemeDecisionEngine};

fn debug_enabled() -> bool {
    std::env::var("AMBIENT_APPEARANCE_DEBUG")
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn seed_theme(controller: &SystemAppearance) -> Theme {
    match controller.current() {
        Ok(theme) => theme,
        Err(err) => {
            warn!("Could not read the current appearance ({err}); assuming Light");
            Theme::Light
        }
    }
}

fn reload_settings<B: SensorBackend, C: ThemeController>(
    store: &SettingsStore,
    switcher: &AppearanceSwitcher<B, C>,
    debug: bool,
) {
    let settings = match store.reload() {
        Ok(settings) => settings,
        Err(err) => {
            warn!("Keeping current settings: {err:#}");
            return;
        }
    };

    if let Err(err) = switcher.apply_settings(&settings) {
        warn!("Reloaded settings rejected: {err}");
        return;
    }
    if debug {
        switcher
            .sensor()
            .set_update_interval(UpdateFrequency::Realtime.interval());
    }
    info!(
        "Reloaded settings from {} (band {}..{}, dwell {}s)",
        store.path().display(),
        settings.low_threshold,
        settings.high_threshold,
        settings.min_dwell_secs
    );
}

/// Run until ctrl-c, re-reading settings on SIGHUP.
#[cfg(unix)]
async fn serve<B: SensorBackend, C: ThemeController>(
    store: &SettingsStore,
    switcher: &AppearanceSwitcher<B, C>,
    debug: bool,
) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup =
        signal(SignalKind::hangup()).context("Failed to listen for reload signal")?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("Failed to listen for shutdown signal");
            }
            _ = hangup.recv() => reload_settings(store, switcher, debug),
        }
    }
}

#[cfg(not(unix))]
async fn serve<B: SensorBackend, C: ThemeController>(
    _store: &SettingsStore,
    _switcher: &AppearanceSwitcher<B, C>,
    _debug: bool,
) -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")
}

async fn watch_ambient_light(store: SettingsStore, debug: bool) -> Result<()> {
    let settings = store.get();
    let capability = SensorCapability::for_this_machine(settings.backend_override);

    let backend = match Backend::for_capability(capability) {
        Ok(backend) => backend,
        Err(SensorError::NoSensorPresent) => {
            error!("Couldn't find an ambient light sensor on this machine; nothing to do");
            return Ok(());
        }
        Err(err) => return Err(err).context("Failed to set up the ambient light sensor"),
    };

    let controller = SystemAppearance::new();
    let initial = seed_theme(&controller);
    let engine = ThemeDecisionEngine::new(settings.decision_config(), initial)
        .context("Invalid decision thresholds")?;
    let pipeline = DecisionPipeline::new(engine, controller, settings.pipeline_policy());

    let interval = if debug {
        UpdateFrequency::Realtime.interval()
    } else {
        settings.update_interval()
    };

    let mut switcher = AppearanceSwitcher::new(backend, pipeline, interval);
    if let Err(err) = switcher.start().await {
        error!("Couldn't find an ambient light sensor on this machine: {err}");
        return Ok(());
    }

    serve(&store, &switcher, debug).await?;

    info!("Shutdown requested");
    switcher.stop();
    Ok(())
}

pub fn run() -> Result<()> {
    let debug = debug_enabled();

    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::new()
        .filter_level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .parse_default_env()
        .init();

    info!("Ambient appearance starting up...");

    let settings_path =
        settings::settings_path().context("Neither AMBIENT_APPEARANCE_SETTINGS nor HOME is set")?;
    let store = SettingsStore::new(settings_path)?;
    let settings = store.get();
    info!(
        "Loaded settings from {} (band {}..{}, dwell {}s)",
        store.path().display(),
        settings.low_threshold,
        settings.high_threshold,
        settings.min_dwell_secs
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(watch_ambient_light(store, debug))
}
