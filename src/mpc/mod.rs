//! Differentiable box-constrained MPC/iLQR solving.
//!
//! This module provides the solver trait, its option and result types, and
//! the dynamics collaborator interface.

mod cpu;
#[cfg(feature = "cuda")]
mod cuda;
pub mod error;
pub mod impl_generic;
mod traits;
#[cfg(feature = "wgpu")]
mod wgpu;

pub use error::{MpcError, MpcResult};
pub use traits::{
    AffineModel, BatchOutcome, Bound, CtrlPassthroughDynamics, Dynamics, DynamicsModel,
    GradMethod, MpcAlgorithms, MpcDiagnostics, MpcGradients, MpcOptions, MpcSolution, NoDynamics,
    QuadCost,
};
