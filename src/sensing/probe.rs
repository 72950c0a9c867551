//! One-time detection of which ambient light interface this machine exposes.
//!
//! The two hardware generations are not both queryable through the same
//! system call, and opening the wrong one can fail or stall, so the decision
//! is made from the machine identity alone and never by trial reads.

use std::sync::OnceLock;

use log::info;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::macos_bridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// `AppleLMUController` IOKit service.
    Legacy,
    /// HID event system ambient light service.
    Modern,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Legacy => "legacy",
            BackendKind::Modern => "modern",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineIdentity {
    /// Model identifier such as `MacBookPro16,1`.
    pub model: Option<String>,
    pub cpu_arch: Option<String>,
    pub os_version: Option<String>,
}

impl MachineIdentity {
    pub fn current() -> Self {
        Self {
            model: macos_bridge::machine_model(),
            cpu_arch: System::cpu_arch(),
            os_version: System::long_os_version(),
        }
    }

    pub fn with_model(model: &str, cpu_arch: Option<&str>) -> Self {
        Self {
            model: Some(model.to_owned()),
            cpu_arch: cpu_arch.map(str::to_owned),
            os_version: None,
        }
    }

    fn is_apple_silicon(&self) -> bool {
        matches!(self.cpu_arch.as_deref(), Some("arm64" | "aarch64"))
    }
}

/// Families whose first generation with the HID sensor is `major` or later.
const MODERN_SINCE: &[(&str, u32)] = &[
    ("MacBookPro", 13),
    ("MacBookAir", 8),
    ("MacBook", 9),
    ("iMac", 18),
];

/// Desktops shipped without an ambient light sensor.
const NO_SENSOR_FAMILIES: &[&str] = &["Macmini", "MacPro"];

/// Split `MacBookPro16,1` into (`MacBookPro`, 16).
fn split_model(model: &str) -> Option<(&str, u32)> {
    let digits_at = model.find(|c: char| c.is_ascii_digit())?;
    let (family, rest) = model.split_at(digits_at);
    let major = rest.split(',').next()?.parse().ok()?;
    Some((family, major))
}

/// Decide the interface from the machine identity.
pub fn classify(identity: &MachineIdentity) -> Option<BackendKind> {
    let model = identity.model.as_deref()?;
    let (family, major) = split_model(model)?;

    if NO_SENSOR_FAMILIES.contains(&family) {
        return None;
    }

    if identity.is_apple_silicon() {
        return Some(BackendKind::Modern);
    }

    match family {
        "iMacPro" | "Mac" => Some(BackendKind::Modern),
        _ => MODERN_SINCE
            .iter()
            .find(|(name, _)| *name == family)
            .map(|(_, since)| {
                if major >= *since {
                    BackendKind::Modern
                } else {
                    BackendKind::Legacy
                }
            }),
    }
}

/// Result of the capability probe. Computed once per process and handed to
/// constructors by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorCapability {
    kind: Option<BackendKind>,
    identity: MachineIdentity,
}

static CAPABILITY: OnceLock<SensorCapability> = OnceLock::new();

impl SensorCapability {
    /// Capability with a fixed kind, for wiring that must not touch hardware.
    pub fn fixed(kind: Option<BackendKind>) -> Self {
        Self {
            kind,
            identity: MachineIdentity::default(),
        }
    }

    pub fn probe(identity: MachineIdentity, override_kind: Option<BackendKind>) -> Self {
        let kind = override_kind.or_else(|| classify(&identity));
        Self { kind, identity }
    }

    /// Process-wide capability. Only the first call probes; `override_kind`
    /// is ignored on every later call.
    pub fn for_this_machine(override_kind: Option<BackendKind>) -> &'static SensorCapability {
        CAPABILITY.get_or_init(|| {
            let capability = Self::probe(MachineIdentity::current(), override_kind);
            info!(
                "Capability probe: model={} arch={} os={} -> backend={}{}",
                capability.identity.model.as_deref().unwrap_or("unknown"),
                capability.identity.cpu_arch.as_deref().unwrap_or("unknown"),
                capability.identity.os_version.as_deref().unwrap_or("unknown"),
                capability.kind.map(|kind| kind.as_str()).unwrap_or("none"),
                if override_kind.is_some() { " (override)" } else { "" },
            );
            capability
        })
    }

    pub fn kind(&self) -> Option<BackendKind> {
        self.kind
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }
}

/// Interface kind of this machine, probing on first use.
pub fn backend_kind_for_this_machine() -> Option<BackendKind> {
    SensorCapability::for_this_machine(None).kind()
}
