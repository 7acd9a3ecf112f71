//! Generic implementations of the MPC solver.
//!
//! These implementations work across all Runtime backends using tensor operations.

pub mod linearize;
pub mod lqr_step;
pub mod mpc;
pub mod pnqp;
pub mod utils;

pub use linearize::linearize_dynamics_impl;
pub use lqr_step::{lqr_step_impl, LqrStepConfig, LqrStepOutput};
pub use mpc::{mpc_grad_impl, mpc_impl};
pub use pnqp::{pnqp_impl, PnqpSolution};
