pub mod backend;
mod loop_worker;
pub mod probe;
pub mod sensor;

pub use backend::{Backend, LegacyBackend, ModernBackend, Reading, SensorBackend, SensorError};
pub use probe::{backend_kind_for_this_machine, BackendKind, MachineIdentity, SensorCapability};
pub use sensor::{AmbientLightSensor, SampleListener, UpdateFrequency};
