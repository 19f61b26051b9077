//! Machine lifecycle controllers and the assembly that wires one emulated
//! machine together: store, controller runtime, node-management API, event
//! publisher.

pub mod config;
pub mod machine;
pub mod meta;
pub mod reboot;
pub mod services;
pub mod status;
pub mod version;

pub use config::MachineConfigController;
pub use machine::{HardwareParams, Machine, MachineError, MachineParams};
pub use meta::UniqueTokenController;
pub use reboot::RebootStatusController;
pub use services::ServiceController;
pub use status::MachineStatusController;
pub use version::{ExtensionStatusController, KernelCmdlineController, VersionController};
