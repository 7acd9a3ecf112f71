//! CUDA implementation of the MPC solver.

use numr::runtime::cuda::{CudaClient, CudaRuntime};
use numr::tensor::Tensor;

use crate::mpc::error::MpcResult;
use crate::mpc::impl_generic::{mpc_grad_impl, mpc_impl};
use crate::mpc::traits::dynamics::{Dynamics, DynamicsModel};
use crate::mpc::traits::{MpcAlgorithms, MpcGradients, MpcOptions, MpcSolution, QuadCost};

impl MpcAlgorithms<CudaRuntime> for CudaClient {
    fn solve_mpc<D>(
        &self,
        cost: &QuadCost<CudaRuntime>,
        x_init: &Tensor<CudaRuntime>,
        dynamics: DynamicsModel<'_, CudaRuntime, D>,
        options: &MpcOptions<CudaRuntime>,
    ) -> MpcResult<MpcSolution<CudaRuntime>>
    where
        D: Dynamics<CudaRuntime, Self>,
    {
        mpc_impl(self, cost, x_init, dynamics, options)
    }

    fn mpc_grad(
        &self,
        solution: &MpcSolution<CudaRuntime>,
        dl_dx: &Tensor<CudaRuntime>,
        dl_du: &Tensor<CudaRuntime>,
    ) -> MpcResult<MpcGradients<CudaRuntime>> {
        mpc_grad_impl(self, solution, dl_dx, dl_du)
    }
}
