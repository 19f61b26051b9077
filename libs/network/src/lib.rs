//! Network controllers for the emulated machine: one synthetic `eth0`, one
//! overlay link, and the hostname/nodename derivation chain.

pub mod address;
pub mod hostname;
pub mod link;
pub mod nodename;

pub use address::{AddressStatusController, NodeAddressController};
pub use hostname::{HostnameConfigController, HostnameStatusController};
pub use link::LinkStatusController;
pub use nodename::NodenameController;
