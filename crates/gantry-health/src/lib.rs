//! gantry-health — missed-heartbeat liveness for the node fleet.
//!
//! Scans the registry on a fixed interval and demotes `online` nodes that
//! have gone quiet for longer than twice that interval. Recovery is
//! implicit: the next successful agent handshake puts the node back
//! online. This is a single-authority heartbeat policy, not a quorum
//! failure detector.

pub mod monitor;

pub use monitor::{DegradedCallback, HealthMonitor};
