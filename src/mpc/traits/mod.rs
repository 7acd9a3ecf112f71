//! Trait definitions and types for the MPC solver.

pub mod dynamics;
pub mod mpc;
mod types;

pub use dynamics::{AffineModel, CtrlPassthroughDynamics, Dynamics, DynamicsModel, NoDynamics};
pub use mpc::MpcAlgorithms;
pub use types::{
    BatchOutcome, Bound, GradMethod, MpcDiagnostics, MpcGradients, MpcOptions, MpcSolution,
    QuadCost,
};

pub(crate) use types::BackwardContext;
