//! CPU implementation of the MPC solver.

use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

use crate::mpc::error::MpcResult;
use crate::mpc::impl_generic::{mpc_grad_impl, mpc_impl};
use crate::mpc::traits::dynamics::{Dynamics, DynamicsModel};
use crate::mpc::traits::{MpcAlgorithms, MpcGradients, MpcOptions, MpcSolution, QuadCost};

impl MpcAlgorithms<CpuRuntime> for CpuClient {
    fn solve_mpc<D>(
        &self,
        cost: &QuadCost<CpuRuntime>,
        x_init: &Tensor<CpuRuntime>,
        dynamics: DynamicsModel<'_, CpuRuntime, D>,
        options: &MpcOptions<CpuRuntime>,
    ) -> MpcResult<MpcSolution<CpuRuntime>>
    where
        D: Dynamics<CpuRuntime, Self>,
    {
        mpc_impl(self, cost, x_init, dynamics, options)
    }

    fn mpc_grad(
        &self,
        solution: &MpcSolution<CpuRuntime>,
        dl_dx: &Tensor<CpuRuntime>,
        dl_du: &Tensor<CpuRuntime>,
    ) -> MpcResult<MpcGradients<CpuRuntime>> {
        mpc_grad_impl(self, solution, dl_dx, dl_du)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mpc::error::MpcError;
    use crate::mpc::traits::{AffineModel, BatchOutcome, Bound, GradMethod};
    use numr::dtype::DType;
    use numr::ops::{BinaryOps, ScalarOps, UtilityOps};
    use numr::runtime::cpu::CpuDevice;

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    /// Identity quadratic cost 0.5 (x'x + u'u) over the horizon.
    fn identity_cost(client: &CpuClient, horizon: usize, n_batch: usize, n_tau: usize) -> QuadCost<CpuRuntime> {
        let c_mat = client
            .eye(n_tau, None, DType::F64)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .broadcast_to(&[horizon, n_batch, n_tau, n_tau])
            .unwrap()
            .contiguous();
        let c_vec = client
            .fill(&[horizon, n_batch, n_tau], 0.0, DType::F64)
            .unwrap();
        QuadCost { c_mat, c_vec }
    }

    /// Scalar integrator x_{t+1} = x_t + u_t as affine coefficients.
    fn integrator_f(device: &CpuDevice, horizon: usize, n_batch: usize) -> Tensor<CpuRuntime> {
        let mut data = Vec::with_capacity((horizon - 1) * n_batch * 2);
        for _ in 0..(horizon - 1) * n_batch {
            data.push(1.0);
            data.push(1.0);
        }
        Tensor::<CpuRuntime>::from_slice(&data, &[horizon - 1, n_batch, 1, 2], device)
    }

    /// x_{t+1} = x + u elementwise, with analytic Jacobians.
    struct Integrator;

    impl Dynamics<CpuRuntime, CpuClient> for Integrator {
        fn step(
            &self,
            client: &CpuClient,
            x: &Tensor<CpuRuntime>,
            u: &Tensor<CpuRuntime>,
        ) -> MpcResult<Tensor<CpuRuntime>> {
            Ok(client.add(x, u)?)
        }

        fn jacobian(
            &self,
            client: &CpuClient,
            x: &Tensor<CpuRuntime>,
            _u: &Tensor<CpuRuntime>,
        ) -> MpcResult<Option<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)>> {
            let n_batch = x.shape()[0];
            let n = x.shape()[1];
            let eye = client
                .eye(n, None, DType::F64)?
                .unsqueeze(0)?
                .broadcast_to(&[n_batch, n, n])?
                .contiguous();
            Ok(Some((eye.clone(), eye)))
        }
    }

    /// x_{t+1} = x + u + 0.1 x^2 elementwise.
    struct MildlyNonlinear;

    impl Dynamics<CpuRuntime, CpuClient> for MildlyNonlinear {
        fn step(
            &self,
            client: &CpuClient,
            x: &Tensor<CpuRuntime>,
            u: &Tensor<CpuRuntime>,
        ) -> MpcResult<Tensor<CpuRuntime>> {
            let sq = client.mul_scalar(&client.mul(x, x)?, 0.1)?;
            Ok(client.add(&client.add(x, u)?, &sq)?)
        }

        fn jacobian(
            &self,
            client: &CpuClient,
            x: &Tensor<CpuRuntime>,
            _u: &Tensor<CpuRuntime>,
        ) -> MpcResult<Option<(Tensor<CpuRuntime>, Tensor<CpuRuntime>)>> {
            let n_batch = x.shape()[0];
            let n = x.shape()[1];
            let eye = client
                .eye(n, None, DType::F64)?
                .unsqueeze(0)?
                .broadcast_to(&[n_batch, n, n])?
                .contiguous();
            let diag = client.mul(
                &eye,
                &client
                    .mul_scalar(x, 0.2)?
                    .unsqueeze(2)?
                    .broadcast_to(&[n_batch, n, n])?,
            )?;
            Ok(Some((client.add(&eye, &diag)?, eye)))
        }
    }

    #[test]
    fn test_matches_closed_form_lqr() {
        let (device, client) = setup();
        // min 0.5 sum x_t^2 + u_t^2 over x_{t+1} = x_t + u_t, x_0 = 1, T = 3.
        // Solving the normal equations by hand: u = (-3/5, -1/5, 0).
        let cost = identity_cost(&client, 3, 1, 2);
        let f_mat = integrator_f(&device, 3, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);

        let options = MpcOptions::new(1, 1, 3);
        let solution = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();

        let u: Vec<f64> = solution.u.to_vec();
        assert!((u[0] + 0.6).abs() < 1e-6, "u0 = {}", u[0]);
        assert!((u[1] + 0.2).abs() < 1e-6, "u1 = {}", u[1]);
        assert!(u[2].abs() < 1e-6, "u2 = {}", u[2]);
        let x: Vec<f64> = solution.x.to_vec();
        assert!((x[1] - 0.4).abs() < 1e-6);
        assert!((x[2] - 0.2).abs() < 1e-6);
        assert!(solution
            .outcomes
            .iter()
            .all(|o| *o == BatchOutcome::Converged));
    }

    #[test]
    fn test_box_bounds_satisfied_exactly() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 4, 2, 2);
        let f_mat = integrator_f(&device, 4, 2);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[2.0, -3.0], &[2, 1], &device);

        let mut options = MpcOptions::new(1, 1, 4);
        options.u_lower = Some(Bound::Scalar(-0.25));
        options.u_upper = Some(Bound::Scalar(0.25));
        options.exit_unconverged = false;

        let solution = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();

        let us: Vec<f64> = solution.u.to_vec();
        for v in us {
            assert!((-0.25..=0.25).contains(&v), "control {} out of bounds", v);
        }
        // x_0 = 2 pulls hard toward negative controls; the first step should
        // saturate the lower bound.
        let u: Vec<f64> = solution.u.to_vec();
        assert_eq!(u[0], -0.25);
    }

    #[test]
    fn test_warm_start_is_idempotent() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 3, 1, 2);
        let f_mat = integrator_f(&device, 3, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);
        let options = MpcOptions::new(1, 1, 3);
        let model = AffineModel::Affine {
            f_mat: &f_mat,
            f_vec: None,
        };

        let first = client.solve_mpc(&cost, &x_init, model, &options).unwrap();

        let mut warm = options.clone();
        warm.u_init = Some(first.u.clone());
        let second = client.solve_mpc(&cost, &x_init, model, &warm).unwrap();

        assert_eq!(second.diagnostics.iterations, 1);
        for n in &second.diagnostics.full_du_norm {
            assert!(*n < 1e-6, "du norm {} after warm start", n);
        }
    }

    #[test]
    fn test_best_cost_monotone_in_iteration_budget() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 4, 1, 2);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.5], &[1, 1], &device);
        let dyn_fn = MildlyNonlinear;

        let mut prev: Option<f64> = None;
        for lqr_iter in [1usize, 2, 4, 8] {
            let mut options = MpcOptions::new(1, 1, 4);
            options.lqr_iter = lqr_iter;
            options.exit_unconverged = false;
            options.grad_method = GradMethod::Analytic;
            let solution = client
                .solve_mpc(&cost, &x_init, DynamicsModel::Nonlinear(&dyn_fn), &options)
                .unwrap();
            let c: Vec<f64> = solution.costs.to_vec();
            if let Some(p) = prev {
                assert!(c[0] <= p + 1e-10, "cost went up: {} > {}", c[0], p);
            }
            prev = Some(c[0]);
        }
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 3, 1, 2);
        let f_mat = integrator_f(&device, 3, 1);
        let options = MpcOptions::new(1, 1, 3);
        let model = AffineModel::Affine {
            f_mat: &f_mat,
            f_vec: None,
        };

        // Loss = sum of states over the trajectory.
        let state_sum = |x0: f64| -> f64 {
            let x_init = Tensor::<CpuRuntime>::from_slice(&[x0], &[1, 1], &device);
            let solution = client.solve_mpc(&cost, &x_init, model, &options).unwrap();
            let xs: Vec<f64> = solution.x.to_vec();
            xs.iter().sum()
        };

        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);
        let solution = client.solve_mpc(&cost, &x_init, model, &options).unwrap();
        let dl_dx = client.fill(&[3, 1, 1], 1.0, DType::F64).unwrap();
        let dl_du = client.fill(&[3, 1, 1], 0.0, DType::F64).unwrap();
        let grads = client.mpc_grad(&solution, &dl_dx, &dl_du).unwrap();
        let analytic: Vec<f64> = grads.dx_init.to_vec();

        let h = 1e-5;
        let fd = (state_sum(1.0 + h) - state_sum(1.0 - h)) / (2.0 * h);
        assert!(
            (analytic[0] - fd).abs() < 1e-4,
            "dx_init {} vs finite difference {}",
            analytic[0],
            fd
        );
    }

    #[test]
    fn test_batch_elements_are_independent() {
        let (device, client) = setup();
        let f_mat2 = integrator_f(&device, 3, 2);
        let cost2 = identity_cost(&client, 3, 2, 2);
        let x_init2 = Tensor::<CpuRuntime>::from_slice(&[1.0, -2.0], &[2, 1], &device);
        let options = MpcOptions::new(1, 1, 3);

        let batched = client
            .solve_mpc(
                &cost2,
                &x_init2,
                AffineModel::Affine {
                    f_mat: &f_mat2,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();
        let batched_u: Vec<f64> = batched.u.to_vec();

        for (j, &x0) in [1.0f64, -2.0].iter().enumerate() {
            let f_mat1 = integrator_f(&device, 3, 1);
            let cost1 = identity_cost(&client, 3, 1, 2);
            let x_init1 = Tensor::<CpuRuntime>::from_slice(&[x0], &[1, 1], &device);
            let single = client
                .solve_mpc(
                    &cost1,
                    &x_init1,
                    AffineModel::Affine {
                        f_mat: &f_mat1,
                        f_vec: None,
                    },
                    &options,
                )
                .unwrap();
            let single_u: Vec<f64> = single.u.to_vec();
            for t in 0..3 {
                assert!(
                    (batched_u[t * 2 + j] - single_u[t]).abs() < 1e-10,
                    "batch element {} differs at t = {}",
                    j,
                    t
                );
            }
        }
    }

    #[test]
    fn test_zero_width_bounds_return_no_nan() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 3, 1, 2);
        let f_mat = integrator_f(&device, 3, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);

        let mut options = MpcOptions::new(1, 1, 3);
        options.u_lower = Some(Bound::Scalar(0.3));
        options.u_upper = Some(Bound::Scalar(0.3));
        options.exit_unconverged = false;

        let solution = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();
        let us: Vec<f64> = solution.u.to_vec();
        for v in us {
            assert!(v.is_finite());
            assert_eq!(v, 0.3);
        }
        let xs: Vec<f64> = solution.x.to_vec();
        for v in xs {
            assert!(v.is_finite());
        }
    }

    #[test]
    fn test_unconverged_exit_vs_detach() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 4, 1, 2);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[3.0], &[1, 1], &device);
        let dyn_fn = MildlyNonlinear;

        // One outer iteration cannot reach a fixed point from a zero start.
        let mut options = MpcOptions::new(1, 1, 4);
        options.lqr_iter = 1;
        options.exit_unconverged = true;
        let err = client
            .solve_mpc(&cost, &x_init, DynamicsModel::Nonlinear(&dyn_fn), &options)
            .unwrap_err();
        assert!(matches!(err, MpcError::DidNotConverge { .. }));

        options.exit_unconverged = false;
        options.detach_unconverged = true;
        let solution = client
            .solve_mpc(&cost, &x_init, DynamicsModel::Nonlinear(&dyn_fn), &options)
            .unwrap();
        assert!(solution
            .outcomes
            .iter()
            .any(|o| *o == BatchOutcome::Unconverged));

        // Detached elements contribute nothing to gradients.
        let dl_dx = client.fill(&[4, 1, 1], 1.0, DType::F64).unwrap();
        let dl_du = client.fill(&[4, 1, 1], 0.0, DType::F64).unwrap();
        let grads = client.mpc_grad(&solution, &dl_dx, &dl_du).unwrap();
        let dx: Vec<f64> = grads.dx_init.to_vec();
        for v in dx {
            assert_eq!(v, 0.0);
        }
    }

    #[test]
    fn test_mismatched_bounds_are_rejected() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 3, 1, 2);
        let f_mat = integrator_f(&device, 3, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);

        let mut options = MpcOptions::new(1, 1, 3);
        options.u_lower = Some(Bound::Scalar(-1.0));
        let err = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap_err();
        assert!(matches!(err, MpcError::Config { .. }));
    }

    #[test]
    fn test_slew_rate_penalty_smooths_controls() {
        let (device, client) = setup();
        // Track a distant setpoint; without a slew penalty the first control
        // jumps, with one it ramps.
        let horizon = 5;
        let cost = identity_cost(&client, horizon, 1, 2);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[4.0], &[1, 1], &device);
        let dyn_fn = Integrator;

        let total_slew = |penalty: Option<f64>| -> f64 {
            let mut options = MpcOptions::new(1, 1, horizon);
            options.slew_rate_penalty = penalty;
            options.exit_unconverged = false;
            let solution = client
                .solve_mpc(&cost, &x_init, DynamicsModel::Nonlinear(&dyn_fn), &options)
                .unwrap();
            assert_eq!(solution.x.shape(), &[horizon, 1, 1]);
            let u: Vec<f64> = solution.u.to_vec();
            let mut slew = (u[0] - 0.0).abs();
            for t in 1..horizon {
                slew += (u[t] - u[t - 1]).abs();
            }
            slew
        };

        let free = total_slew(None);
        let penalized = total_slew(Some(10.0));
        assert!(
            penalized < free,
            "slew {} with penalty vs {} without",
            penalized,
            free
        );
    }

    #[test]
    fn test_unbatched_cost_is_broadcast() {
        let (device, client) = setup();
        // C given as [T, n_tau, n_tau] with n_batch in the options.
        let c_mat = client
            .eye(2, None, DType::F64)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .broadcast_to(&[3, 2, 2])
            .unwrap()
            .contiguous();
        let c_vec = client.fill(&[3, 2], 0.0, DType::F64).unwrap();
        let cost = QuadCost { c_mat, c_vec };
        let f_mat = integrator_f(&device, 3, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);

        let mut options = MpcOptions::new(1, 1, 3);
        options.n_batch = Some(1);
        let solution = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();
        let u: Vec<f64> = solution.u.to_vec();
        assert!((u[0] + 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_cost_term_gradients_match_finite_differences() {
        let (device, client) = setup();
        let f_mat = integrator_f(&device, 3, 1);
        let options = MpcOptions::new(1, 1, 3);
        let c_vec_base = [0.0f64; 6];
        let f_vec_base = [0.1f64, -0.2];

        // Loss = sum of states, as a function of the linear cost terms.
        let state_sum = |c_vec_data: &[f64], f_vec_data: &[f64]| -> f64 {
            let c_mat = client
                .eye(2, None, DType::F64)
                .unwrap()
                .unsqueeze(0)
                .unwrap()
                .unsqueeze(0)
                .unwrap()
                .broadcast_to(&[3, 1, 2, 2])
                .unwrap()
                .contiguous();
            let c_vec = Tensor::<CpuRuntime>::from_slice(c_vec_data, &[3, 1, 2], &device);
            let f_vec = Tensor::<CpuRuntime>::from_slice(f_vec_data, &[2, 1, 1], &device);
            let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);
            let solution = client
                .solve_mpc(
                    &QuadCost { c_mat, c_vec },
                    &x_init,
                    AffineModel::Affine {
                        f_mat: &f_mat,
                        f_vec: Some(&f_vec),
                    },
                    &options,
                )
                .unwrap();
            let xs: Vec<f64> = solution.x.to_vec();
            xs.iter().sum()
        };

        let c_mat = client
            .eye(2, None, DType::F64)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .unsqueeze(0)
            .unwrap()
            .broadcast_to(&[3, 1, 2, 2])
            .unwrap()
            .contiguous();
        let c_vec = Tensor::<CpuRuntime>::from_slice(&c_vec_base, &[3, 1, 2], &device);
        let f_vec = Tensor::<CpuRuntime>::from_slice(&f_vec_base, &[2, 1, 1], &device);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[1.0], &[1, 1], &device);
        let solution = client
            .solve_mpc(
                &QuadCost { c_mat, c_vec },
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: Some(&f_vec),
                },
                &options,
            )
            .unwrap();
        let dl_dx = client.fill(&[3, 1, 1], 1.0, DType::F64).unwrap();
        let dl_du = client.fill(&[3, 1, 1], 0.0, DType::F64).unwrap();
        let grads = client.mpc_grad(&solution, &dl_dx, &dl_du).unwrap();

        let h = 1e-5;
        let dc_vec: Vec<f64> = grads.dc_vec.to_vec();
        for i in 0..6 {
            let mut up = c_vec_base;
            let mut down = c_vec_base;
            up[i] += h;
            down[i] -= h;
            let fd = (state_sum(&up, &f_vec_base) - state_sum(&down, &f_vec_base)) / (2.0 * h);
            assert!(
                (dc_vec[i] - fd).abs() < 1e-4,
                "dc_vec[{}] = {} vs finite difference {}",
                i,
                dc_vec[i],
                fd
            );
        }

        let df_vec: Vec<f64> = grads.df_vec.expect("residual gradient present").to_vec();
        for i in 0..2 {
            let mut up = f_vec_base;
            let mut down = f_vec_base;
            up[i] += h;
            down[i] -= h;
            let fd = (state_sum(&c_vec_base, &up) - state_sum(&c_vec_base, &down)) / (2.0 * h);
            assert!(
                (df_vec[i] - fd).abs() < 1e-4,
                "df_vec[{}] = {} vs finite difference {}",
                i,
                df_vec[i],
                fd
            );
        }
    }

    #[test]
    fn test_bound_active_controls_carry_no_sensitivity() {
        let (device, client) = setup();
        let cost = identity_cost(&client, 4, 1, 2);
        let f_mat = integrator_f(&device, 4, 1);
        let x_init = Tensor::<CpuRuntime>::from_slice(&[2.0], &[1, 1], &device);

        let mut options = MpcOptions::new(1, 1, 4);
        options.u_lower = Some(Bound::Scalar(-0.25));
        options.u_upper = Some(Bound::Scalar(0.25));
        options.exit_unconverged = false;

        let solution = client
            .solve_mpc(
                &cost,
                &x_init,
                AffineModel::Affine {
                    f_mat: &f_mat,
                    f_vec: None,
                },
                &options,
            )
            .unwrap();
        let u: Vec<f64> = solution.u.to_vec();
        assert!(u.iter().any(|&v| v == -0.25), "no saturated stage: {:?}", u);

        let dl_dx = client.fill(&[4, 1, 1], 1.0, DType::F64).unwrap();
        let dl_du = client.fill(&[4, 1, 1], 0.0, DType::F64).unwrap();
        let grads = client.mpc_grad(&solution, &dl_dx, &dl_du).unwrap();

        // The companion solve pins bound-active dims at zero, so the control
        // component of the linear cost gradient vanishes at saturated stages.
        let dc_vec: Vec<f64> = grads.dc_vec.to_vec();
        for t in 0..4 {
            if u[t] == -0.25 || u[t] == 0.25 {
                assert_eq!(
                    dc_vec[t * 2 + 1],
                    0.0,
                    "stage {} control sensitivity should be pinned",
                    t
                );
            }
        }
    }
}
