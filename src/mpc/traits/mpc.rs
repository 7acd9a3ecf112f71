//! The MPC solver trait.

use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::mpc::error::MpcResult;
use crate::mpc::traits::dynamics::{Dynamics, DynamicsModel};
use crate::mpc::traits::types::{MpcGradients, MpcOptions, MpcSolution, QuadCost};

/// Trait for the differentiable box-constrained MPC solver.
///
/// Solves, per batch element,
///
/// ```text
/// min_{x, u}  sum_t 0.5 tau_t' C_t tau_t + c_t' tau_t,   tau_t = [x_t; u_t]
/// s.t.        x_{t+1} = f(x_t, u_t),  x_0 = x_init,
///             u_lower <= u <= u_upper
/// ```
///
/// by iterated linearization and box-constrained LQR steps (box-DDP with a
/// first-order dynamics approximation). Gradients with respect to the problem
/// data are exposed through [`mpc_grad`](Self::mpc_grad), which differentiates
/// the KKT conditions at the fixed point with a single companion LQR solve
/// instead of unrolling the outer iteration.
///
/// # Example
///
/// ```ignore
/// use mpcr::mpc::{AffineModel, MpcAlgorithms, MpcOptions, QuadCost};
/// use numr::runtime::cpu::{CpuClient, CpuDevice};
///
/// let device = CpuDevice::new();
/// let client = CpuClient::new(device.clone());
///
/// let options = MpcOptions::new(n_state, n_ctrl, horizon);
/// let solution = client.solve_mpc(
///     &QuadCost { c_mat, c_vec },
///     &x_init,
///     AffineModel::Affine { f_mat: &f_mat, f_vec: None },
///     &options,
/// )?;
/// ```
pub trait MpcAlgorithms<R: Runtime>: RuntimeClient<R> + Sized {
    /// Solve the control problem, returning the converged trajectory, its
    /// per-element cost, and the saved fixed-point data for [`mpc_grad`](Self::mpc_grad).
    fn solve_mpc<D>(
        &self,
        cost: &QuadCost<R>,
        x_init: &Tensor<R>,
        dynamics: DynamicsModel<'_, R, D>,
        options: &MpcOptions<R>,
    ) -> MpcResult<MpcSolution<R>>
    where
        D: Dynamics<R, Self>;

    /// Gradients of a scalar loss with respect to the problem data, given the
    /// loss sensitivities `dl_dx: [T, n_batch, n_state]` and
    /// `dl_du: [T, n_batch, n_ctrl]` on the returned trajectory.
    ///
    /// Costs one LQR solve regardless of how many outer iterations the
    /// forward solve took. Control dimensions that finished on a box bound
    /// (and batch elements detached for non-convergence) contribute zero
    /// sensitivity.
    fn mpc_grad(
        &self,
        solution: &MpcSolution<R>,
        dl_dx: &Tensor<R>,
        dl_du: &Tensor<R>,
    ) -> MpcResult<MpcGradients<R>>;
}
