use std::fmt;

use log::debug;
use serde::Serialize;
use thiserror::Error;

use crate::macos_bridge::{self, HidAlsClient, LmuConnection};

use super::probe::{BackendKind, SensorCapability};

/// Normalized light level on an approximate lux scale.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize)]
pub struct Reading(f64);

impl Reading {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SensorError {
    /// The read failed this time; the next tick tries again.
    #[error("ambient light hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// No sensor of the probed kind exists. Permanent for the process.
    #[error("no ambient light sensor present on this machine")]
    NoSensorPresent,
}

impl SensorError {
    pub fn unavailable(reason: impl fmt::Display) -> Self {
        SensorError::HardwareUnavailable(reason.to_string())
    }
}

/// Access path to one kind of ambient light hardware.
pub trait SensorBackend: Send + 'static {
    fn kind(&self) -> BackendKind;

    /// Whether any sensor of this kind exists on the machine. Cheap and free of
    /// side effects; says nothing about whether a read would succeed now.
    fn is_present(&self) -> bool;

    /// Take one sample. May block on the hardware call.
    fn read(&mut self) -> Result<Reading, SensorError>;

    /// Drop any hardware connection opened by `read`.
    fn release(&mut self) {}
}

/// Convert a raw `AppleLMUController` channel value to lux.
pub fn lmu_to_lux(raw: f64) -> f64 {
    let lux = -3.0e-27 * raw.powi(4) + 2.6e-19 * raw.powi(3) - 3.4e-12 * raw.powi(2)
        + 3.9e-5 * raw
        - 0.19;
    lux.max(0.0)
}

fn normalize(value: f64) -> Result<Reading, SensorError> {
    if !value.is_finite() {
        return Err(SensorError::unavailable(format!(
            "sensor returned non-finite value {value}"
        )));
    }
    Ok(Reading::new(value.max(0.0)))
}

#[derive(Default)]
pub struct LegacyBackend {
    connection: Option<LmuConnection>,
}

impl LegacyBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensorBackend for LegacyBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Legacy
    }

    fn is_present(&self) -> bool {
        self.connection.is_some() || macos_bridge::lmu_service_present()
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        if self.connection.is_none() {
            let connection = LmuConnection::open().map_err(SensorError::unavailable)?;
            debug!("Opened AppleLMUController connection");
            self.connection = Some(connection);
        }

        let channels = match self.connection.as_ref() {
            Some(connection) => connection.read_channels(),
            None => return Err(SensorError::unavailable("LMU connection missing")),
        };

        match channels {
            Ok([left, right]) => {
                let raw = (left as f64 + right as f64) / 2.0;
                normalize(lmu_to_lux(raw))
            }
            Err(err) => {
                // Reopen on the next read; the service may have been reset.
                self.connection = None;
                Err(SensorError::unavailable(err))
            }
        }
    }

    fn release(&mut self) {
        if self.connection.take().is_some() {
            debug!("Closed AppleLMUController connection");
        }
    }
}

#[derive(Default)]
pub struct ModernBackend {
    client: Option<HidAlsClient>,
}

impl ModernBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensorBackend for ModernBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Modern
    }

    fn is_present(&self) -> bool {
        macos_bridge::hid_als_service_present()
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        if self.client.is_none() {
            let client = HidAlsClient::open().map_err(SensorError::unavailable)?;
            debug!("Opened HID ambient light client");
            self.client = Some(client);
        }

        let lux = match self.client.as_ref() {
            Some(client) => client.read_lux(),
            None => return Err(SensorError::unavailable("HID client missing")),
        };

        lux.map_err(SensorError::unavailable).and_then(normalize)
    }

    fn release(&mut self) {
        if self.client.take().is_some() {
            debug!("Released HID ambient light client");
        }
    }
}

/// The backend variant selected for this process.
pub enum Backend {
    Legacy(LegacyBackend),
    Modern(ModernBackend),
}

impl Backend {
    /// Build the variant named by the capability probe. Fails with
    /// `NoSensorPresent` when the probe found nothing or the hardware is absent.
    pub fn for_capability(capability: &SensorCapability) -> Result<Self, SensorError> {
        let backend = match capability.kind() {
            Some(BackendKind::Legacy) => Backend::Legacy(LegacyBackend::new()),
            Some(BackendKind::Modern) => Backend::Modern(ModernBackend::new()),
            None => return Err(SensorError::NoSensorPresent),
        };

        if !backend.is_present() {
            return Err(SensorError::NoSensorPresent);
        }

        Ok(backend)
    }
}

impl SensorBackend for Backend {
    fn kind(&self) -> BackendKind {
        match self {
            Backend::Legacy(backend) => backend.kind(),
            Backend::Modern(backend) => backend.kind(),
        }
    }

    fn is_present(&self) -> bool {
        match self {
            Backend::Legacy(backend) => backend.is_present(),
            Backend::Modern(backend) => backend.is_present(),
        }
    }

    fn read(&mut self) -> Result<Reading, SensorError> {
        match self {
            Backend::Legacy(backend) => backend.read(),
            Backend::Modern(backend) => backend.read(),
        }
    }

    fn release(&mut self) {
        match self {
            Backend::Legacy(backend) => backend.release(),
            Backend::Modern(backend) => backend.release(),
        }
    }
}
