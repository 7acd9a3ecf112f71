//! mpcr - Differentiable Model Predictive Control
//!
//! mpcr solves box-constrained finite-horizon optimal control problems with
//! an iterative LQR solver, and differentiates through the solution. Built on
//! numr's foundational math primitives, it works across all backends
//! (CPU, CUDA, WebGPU).
//!
//! # What It Solves
//!
//! ```text
//! min_{x, u}  sum_t 0.5 tau_t' C_t tau_t + c_t' tau_t     tau_t = [x_t; u_t]
//! subject to  x_{t+1} = f(x_t, u_t),  x_0 = x_init,
//!             u_lower <= u_t <= u_upper
//! ```
//!
//! Nonlinear dynamics are re-linearized every outer iteration; control bounds
//! are handled exactly inside the Riccati recursion with a projected-Newton
//! QP. Gradients with respect to every problem input come from implicit
//! differentiation of the fixed point, at the cost of a single extra
//! unconstrained LQR solve.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       mpcr                               │
//! │   (iLQR outer loop, box-constrained Riccati, pnqp,      │
//! │    linearization, implicit gradients)                   │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ uses
//! ┌──────────────────────────▼──────────────────────────────┐
//! │                       numr                               │
//! │     (tensors, linear solves, autograd, basic linalg)    │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Backend Support
//!
//! mpcr is generic over numr's `Runtime` trait. The same code works on:
//! - CPU (with SIMD acceleration)
//! - CUDA (NVIDIA GPUs)
//! - WebGPU (cross-platform GPU)
//!
//! # Feature Flags
//!
//! | Feature | Description | Dependencies |
//! |---------|-------------|--------------|
//! | `cuda`  | Enable CUDA GPU acceleration | CUDA 12.x, numr/cuda |
//! | `wgpu`  | Enable WebGPU cross-platform GPU | numr/wgpu |
//!
//! ## Backend Limitations
//!
//! - **WebGPU**: Only supports F32 precision (no F64)
//! - **CUDA**: Requires CUDA 12.x toolkit installed
//!
//! # Example
//!
//! ```ignore
//! use mpcr::mpc::{AffineModel, MpcAlgorithms, MpcOptions, QuadCost};
//! use numr::runtime::cpu::{CpuClient, CpuDevice};
//!
//! let device = CpuDevice::new();
//! let client = CpuClient::new(device.clone());
//!
//! let cost = QuadCost { c_mat, c_vec };
//! let options = MpcOptions::new(n_state, n_ctrl, horizon);
//! let solution = client.solve_mpc(
//!     &cost,
//!     &x_init,
//!     AffineModel::Affine { f_mat: &f_mat, f_vec: None },
//!     &options,
//! )?;
//!
//! // Differentiate a downstream loss through the solve.
//! let grads = client.mpc_grad(&solution, &dl_dx, &dl_du)?;
//! ```

pub mod mpc;

// Re-export main types for convenience
pub use mpc::{
    AffineModel, BatchOutcome, Bound, Dynamics, DynamicsModel, GradMethod, MpcAlgorithms,
    MpcDiagnostics, MpcError, MpcGradients, MpcOptions, MpcResult, MpcSolution, NoDynamics,
    QuadCost,
};

// Re-export numr types that users will commonly need
pub use numr::dtype::DType;
pub use numr::error::{Error, Result};
pub use numr::runtime::{Runtime, RuntimeClient};
pub use numr::tensor::Tensor;
