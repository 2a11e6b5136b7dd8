//! The `sculpt_core` crate is the optimization engine behind the sculpt CLI.
//!
//! It drives derivative-based optimization of PDE-constrained shape and control
//! problems while keeping the computational mesh valid.
//!
//! Key components:
//! - **Traits**: `ReducedProblem` (objective, gradient and Hessian action of the
//!   discretized problem) and `Communicator` (collective reductions).
//! - **Mesh**: deformation with a priori/a posteriori validity checks, quality
//!   measures and Gmsh interoperability.
//! - **Constraints**: corner-angle constraints with working-set projection.
//! - **Optimization**: gradient descent, nonlinear CG, L-BFGS and truncated Newton
//!   directions with Armijo or polynomial line searches.
//! - **Remesh**: checkpointing and relaunch around an external mesh generator.
pub mod config;
pub mod constraints;
pub mod error;
pub mod linalg;
pub mod mesh;
pub mod optimization;
pub mod output;
pub mod remesh;
pub mod traits;

pub use config::Config;
pub use error::{Result, SculptError};
pub use optimization::{NonConvergenceReason, Optimizer, RunOutcome};
pub use traits::{Communicator, ReducedProblem, SerialCommunicator, SolveCounts};
