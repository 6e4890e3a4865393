//! gantry-autoscale — cluster-load scale decisions.
//!
//! Reads the registry's online nodes, averages their CPU and memory usage,
//! and decides when the fleet should grow or shrink. Provisioning itself is
//! delegated: decisions go out through a callback and as bus events, and an
//! external hook acquires or releases machines.
//!
//! # Decision rule
//!
//! ```text
//! mean_cpu, mean_mem = averages over online nodes with a snapshot
//!
//! if (mean_cpu > cpu_target or mean_mem > memory_target)
//!    and online < max_nodes:        ScaleOut
//!
//! if mean_cpu < cpu_target / 2 and mean_mem < memory_target / 2
//!    and online > min_nodes:        ScaleIn
//!
//! otherwise:                        Hold
//! ```
//!
//! A single cooldown window covers both directions so the fleet never
//! oscillates between consecutive evaluations.

pub mod scaler;

pub use scaler::{Autoscaler, ScaleCallback, ScaleDecision, ScaleTargets};
