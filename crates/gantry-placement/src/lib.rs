//! gantry-placement — picks the node a new server workload lands on.
//!
//! The balancer is stateless: every call re-evaluates the node set it is
//! handed, so decisions always reflect the latest resource snapshots. It
//! only decides; the control plane executes the decision over the bus.
//!
//! Two strategies:
//!
//! - **`least-loaded`** (default): lowest mean of CPU and memory usage wins
//! - **`geographic`**: restrict to the preferred location first, fall back
//!   to least-loaded over all candidates when none match

pub mod balancer;
pub mod error;

pub use balancer::{Requirements, Strategy, select_node};
pub use error::{PlacementError, PlacementResult};
