//! Small shared helpers: opaque identifiers, retry with jitter, kernel
//! command line parsing, interface-bound dialing.

pub mod cmdline;
pub mod dialer;
pub mod ids;
pub mod image;
pub mod nodename;
pub mod retry;
