//! gantry-registry — the authoritative map of known nodes.
//!
//! Tracks every registered worker node, its declared capabilities, its
//! latest resource snapshot, and its lifecycle status. The registry is the
//! only broadly shared mutable structure in the control plane; it is
//! guarded by a single reader/writer lock and hands out copy-out snapshots,
//! never references.
//!
//! Live bus channels are tracked separately by `gantry-bus`; `connect` /
//! `disconnect` here record the status side of that lifecycle.

pub mod error;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use registry::{NodeRegistration, NodeRegistry};
