//! WebGPU implementation of the MPC solver.

use numr::runtime::wgpu::{WgpuClient, WgpuRuntime};
use numr::tensor::Tensor;

use crate::mpc::error::MpcResult;
use crate::mpc::impl_generic::{mpc_grad_impl, mpc_impl};
use crate::mpc::traits::dynamics::{Dynamics, DynamicsModel};
use crate::mpc::traits::{MpcAlgorithms, MpcGradients, MpcOptions, MpcSolution, QuadCost};

impl MpcAlgorithms<WgpuRuntime> for WgpuClient {
    fn solve_mpc<D>(
        &self,
        cost: &QuadCost<WgpuRuntime>,
        x_init: &Tensor<WgpuRuntime>,
        dynamics: DynamicsModel<'_, WgpuRuntime, D>,
        options: &MpcOptions<WgpuRuntime>,
    ) -> MpcResult<MpcSolution<WgpuRuntime>>
    where
        D: Dynamics<WgpuRuntime, Self>,
    {
        mpc_impl(self, cost, x_init, dynamics, options)
    }

    fn mpc_grad(
        &self,
        solution: &MpcSolution<WgpuRuntime>,
        dl_dx: &Tensor<WgpuRuntime>,
        dl_du: &Tensor<WgpuRuntime>,
    ) -> MpcResult<MpcGradients<WgpuRuntime>> {
        mpc_grad_impl(self, solution, dl_dx, dl_du)
    }
}
