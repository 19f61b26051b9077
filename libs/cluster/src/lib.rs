//! Cluster membership: node identity, discovery affiliate and emulated etcd
//! membership controllers, plus the process-wide global state they publish
//! into.

pub mod affiliate;
pub mod etcd;
pub mod global;
pub mod identity;

pub use affiliate::LocalAffiliateController;
pub use etcd::EtcdMemberController;
pub use global::GlobalState;
pub use identity::NodeIdentityController;
