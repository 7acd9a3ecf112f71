//! Dynamics linearization around a nominal trajectory.
//!
//! Produces the per-timestep affine approximation
//! `x_{t+1} ~ F_t [x_t; u_t] + f_t` consumed by the Riccati recursion, using
//! one of the interchangeable strategies in
//! [`GradMethod`](crate::mpc::GradMethod). Every strategy computes the Taylor
//! residual `f_t = step(x_t, u_t) - R_t x_t - S_t u_t`, not just the
//! Jacobians.

use numr::autograd::{backward, var_mul, var_sum, Var};
use numr::dtype::DType;
use numr::ops::{ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::mpc::error::{MpcError, MpcResult};
use crate::mpc::impl_generic::utils::{at_t, bmv, stack0};
use crate::mpc::traits::dynamics::Dynamics;
use crate::mpc::traits::GradMethod;

const FINITE_DIFF_EPS: f64 = 1e-4;
const ANALYTIC_CHECK_TOL: f64 = 1e-8;

/// Linearize `dynamics` around the nominal `(x, u)` trajectory.
///
/// Returns `(f_mat, f_vec)` with shapes `[T-1, B, n_state, n_tau]` and
/// `[T-1, B, n_state]`.
pub fn linearize_dynamics_impl<R, C, D>(
    client: &C,
    dynamics: &D,
    x: &Tensor<R>,
    u: &Tensor<R>,
    method: GradMethod,
) -> MpcResult<(Tensor<R>, Tensor<R>)>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + UnaryOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R>,
    D: Dynamics<R, C>,
{
    match method {
        GradMethod::Analytic => linearize_analytic(client, dynamics, x, u),
        GradMethod::AutoDiff => linearize_autodiff(client, dynamics, x, u),
        GradMethod::FiniteDiff => linearize_finite_diff(client, dynamics, x, u),
        GradMethod::AnalyticCheck => {
            let (f_mat_a, f_vec_a) = linearize_analytic(client, dynamics, x, u)?;
            let (f_mat_b, _) = linearize_autodiff(client, dynamics, x, u)?;
            let diff = client.abs(&client.sub(&f_mat_a, &f_mat_b)?)?;
            let flat_len: usize = diff.shape().iter().product();
            let max = client.max(&diff.reshape(&[flat_len])?, &[0], false)?;
            let max_err = max.item::<f64>()?;
            if max_err > ANALYTIC_CHECK_TOL {
                return Err(MpcError::AnalyticCheckFailed {
                    max_err,
                    tolerance: ANALYTIC_CHECK_TOL,
                });
            }
            Ok((f_mat_a, f_vec_a))
        }
    }
}

/// One batched Jacobian call over all timesteps at once: `[T-1, B, ...]`
/// flattened into a single `[(T-1)*B, ...]` batch.
fn linearize_analytic<R, C, D>(
    client: &C,
    dynamics: &D,
    x: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<(Tensor<R>, Tensor<R>)>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    let horizon = x.shape()[0];
    let n_batch = x.shape()[1];
    let n_state = x.shape()[2];
    let n_ctrl = u.shape()[2];
    let n_tau = n_state + n_ctrl;
    let flat = (horizon - 1) * n_batch;

    let x_flat = x
        .narrow(0, 0, horizon - 1)?
        .contiguous()
        .reshape(&[flat, n_state])?;
    let u_flat = u
        .narrow(0, 0, horizon - 1)?
        .contiguous()
        .reshape(&[flat, n_ctrl])?;

    let Some((r_x, s_u)) = dynamics.jacobian(client, &x_flat, &u_flat)? else {
        return Err(MpcError::Config {
            message: "analytic linearization requires a dynamics Jacobian".to_string(),
        });
    };

    let f_flat = client.cat(&[&r_x, &s_u], 2)?;
    let next = dynamics.step(client, &x_flat, &u_flat)?;
    let tau_flat = client.cat(&[&x_flat, &u_flat], 1)?;
    let resid = client.sub(&next, &bmv(client, &f_flat, &tau_flat)?)?;

    Ok((
        f_flat.reshape(&[horizon - 1, n_batch, n_state, n_tau])?,
        resid.reshape(&[horizon - 1, n_batch, n_state])?,
    ))
}

/// Reverse-mode linearization: per timestep, differentiate each state output
/// dimension separately with a one-hot mask, assembling the Jacobian row by
/// row. Batched over B, so the overhead is a factor of `n_state`.
fn linearize_autodiff<R, C, D>(
    client: &C,
    dynamics: &D,
    x: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<(Tensor<R>, Tensor<R>)>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
    R::Client: TensorOps<R>,
    D: Dynamics<R, C>,
{
    let horizon = x.shape()[0];
    let n_batch = x.shape()[1];
    let n_state = x.shape()[2];
    let eye = client.eye(n_state, None, DType::F64)?;

    let mut f_mats: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
    let mut f_vecs: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
    for t in 0..horizon - 1 {
        let x_t = at_t(x, t)?;
        let u_t = at_t(u, t)?;

        let mut rows: Vec<Tensor<R>> = Vec::with_capacity(n_state);
        for j in 0..n_state {
            // Fresh graph per output dimension.
            let x_var = Var::new(x_t.clone(), true);
            let u_var = Var::new(u_t.clone(), true);
            let Some(y) = dynamics.step_var(client, &x_var, &u_var)? else {
                return Err(MpcError::Config {
                    message: "autodiff linearization requires step_var dynamics".to_string(),
                });
            };

            let one_hot = eye
                .narrow(0, j, 1)?
                .contiguous()
                .broadcast_to(&[n_batch, n_state])?
                .contiguous();
            let masked = var_mul(&y, &Var::new(one_hot, false), client)?;
            let scalar = var_sum(&masked, &[0, 1], false, client)?;
            let grads = backward(&scalar, client)?;

            let gx = grads
                .get(x_var.id())
                .cloned()
                .ok_or_else(|| MpcError::Config {
                    message: "autodiff linearization: no gradient for the state input"
                        .to_string(),
                })?;
            let gu = grads
                .get(u_var.id())
                .cloned()
                .ok_or_else(|| MpcError::Config {
                    message: "autodiff linearization: no gradient for the control input"
                        .to_string(),
                })?;
            // Row j of F_t for every batch element: [B, 1, n_tau].
            rows.push(client.cat(&[&gx, &gu], 1)?.unsqueeze(1)?);
        }
        let row_refs: Vec<&Tensor<R>> = rows.iter().collect();
        let f_t = client.cat(&row_refs, 1)?;

        let next = dynamics.step(client, &x_t, &u_t)?;
        let tau_t = client.cat(&[&x_t, &u_t], 1)?;
        let resid = client.sub(&next, &bmv(client, &f_t, &tau_t)?)?;

        f_mats.push(f_t);
        f_vecs.push(resid);
    }

    Ok((stack0(client, &f_mats)?, stack0(client, &f_vecs)?))
}

/// Forward finite differences, one input dimension at a time, batched over B.
fn linearize_finite_diff<R, C, D>(
    client: &C,
    dynamics: &D,
    x: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<(Tensor<R>, Tensor<R>)>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    let horizon = x.shape()[0];
    let n_batch = x.shape()[1];
    let n_state = x.shape()[2];
    let n_ctrl = u.shape()[2];
    let eye_x = client.eye(n_state, None, DType::F64)?;
    let eye_u = client.eye(n_ctrl, None, DType::F64)?;

    let mut f_mats: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
    let mut f_vecs: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
    for t in 0..horizon - 1 {
        let x_t = at_t(x, t)?;
        let u_t = at_t(u, t)?;
        let base = dynamics.step(client, &x_t, &u_t)?;

        // Jacobian columns: [B, n_state, 1] each, one per perturbed input dim.
        let mut cols: Vec<Tensor<R>> = Vec::with_capacity(n_state + n_ctrl);
        for i in 0..n_state {
            let delta = eye_x
                .narrow(0, i, 1)?
                .contiguous()
                .broadcast_to(&[n_batch, n_state])?
                .contiguous();
            let x_pert = client.add(&x_t, &client.mul_scalar(&delta, FINITE_DIFF_EPS)?)?;
            let stepped = dynamics.step(client, &x_pert, &u_t)?;
            let col = client.mul_scalar(&client.sub(&stepped, &base)?, 1.0 / FINITE_DIFF_EPS)?;
            cols.push(col.unsqueeze(2)?);
        }
        for i in 0..n_ctrl {
            let delta = eye_u
                .narrow(0, i, 1)?
                .contiguous()
                .broadcast_to(&[n_batch, n_ctrl])?
                .contiguous();
            let u_pert = client.add(&u_t, &client.mul_scalar(&delta, FINITE_DIFF_EPS)?)?;
            let stepped = dynamics.step(client, &x_t, &u_pert)?;
            let col = client.mul_scalar(&client.sub(&stepped, &base)?, 1.0 / FINITE_DIFF_EPS)?;
            cols.push(col.unsqueeze(2)?);
        }
        let col_refs: Vec<&Tensor<R>> = cols.iter().collect();
        let f_t = client.cat(&col_refs, 2)?;

        let tau_t = client.cat(&[&x_t, &u_t], 1)?;
        let resid = client.sub(&base, &bmv(client, &f_t, &tau_t)?)?;

        f_mats.push(f_t);
        f_vecs.push(resid);
    }

    Ok((stack0(client, &f_mats)?, stack0(client, &f_vecs)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use numr::autograd::{var_mul, var_mul_scalar, var_sub};
    use numr::ops::{BinaryOps, UtilityOps};
    use numr::runtime::cpu::{CpuClient, CpuDevice, CpuRuntime};

    fn setup() -> (CpuDevice, CpuClient) {
        let device = CpuDevice::new();
        let client = CpuClient::new(device.clone());
        (device, client)
    }

    /// x_{t+1} = x + u + 0.1 * x * x, elementwise (n_state == n_ctrl).
    struct QuadDynamics;

    impl Dynamics<CpuRuntime, CpuClient> for QuadDynamics {
        fn step(
            &self,
            client: &CpuClient,
            x: &Tensor<CpuRuntime>,
            u: &Tensor<CpuRuntime>,
        ) -> MpcResult<Tensor<CpuRuntime>> {
            let sq = client.mul(x, x)?;
            let quad = client.mul_scalar(&sq, 0.1)?;
            Ok(client.add(&client.add(x, u)?, &quad)?)
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
            // d/dx = I + 0.2 diag(x), d/du = I.
            let dx_diag = client.mul(
                &eye,
                &client
                    .mul_scalar(x, 0.2)?
                    .unsqueeze(2)?
                    .broadcast_to(&[n_batch, n, n])?,
            )?;
            let r_x = client.add(&eye, &dx_diag)?;
            Ok(Some((r_x, eye)))
        }

        fn step_var(
            &self,
            client: &CpuClient,
            x: &numr::autograd::Var<CpuRuntime>,
            u: &numr::autograd::Var<CpuRuntime>,
        ) -> MpcResult<Option<numr::autograd::Var<CpuRuntime>>> {
            let sq = var_mul(x, x, client)?;
            let quad = var_mul_scalar(&sq, 0.1, client)?;
            let neg_u = var_mul_scalar(u, -1.0, client)?;
            let lin = var_sub(x, &neg_u, client)?;
            let neg_quad = var_mul_scalar(&quad, -1.0, client)?;
            Ok(Some(var_sub(&lin, &neg_quad, client)?))
        }
    }

    fn nominal(device: &CpuDevice) -> (Tensor<CpuRuntime>, Tensor<CpuRuntime>) {
        // T = 3, B = 2, n_state = n_ctrl = 2.
        let x = Tensor::<CpuRuntime>::from_slice(
            &[0.1, -0.2, 0.3, 0.4, 0.5, -0.1, 0.2, 0.0, -0.3, 0.6, 0.1, 0.2],
            &[3, 2, 2],
            device,
        );
        let u = Tensor::<CpuRuntime>::from_slice(
            &[0.2, 0.1, -0.1, 0.3, 0.0, 0.4, 0.1, -0.2, 0.3, 0.0, -0.4, 0.1],
            &[3, 2, 2],
            device,
        );
        (x, u)
    }

    #[test]
    fn test_strategies_agree() {
        let (device, client) = setup();
        let (x, u) = nominal(&device);
        let dyn_fn = QuadDynamics;

        let (f_a, r_a) =
            linearize_dynamics_impl(&client, &dyn_fn, &x, &u, GradMethod::Analytic).unwrap();
        let (f_b, r_b) =
            linearize_dynamics_impl(&client, &dyn_fn, &x, &u, GradMethod::AutoDiff).unwrap();
        let (f_c, r_c) =
            linearize_dynamics_impl(&client, &dyn_fn, &x, &u, GradMethod::FiniteDiff).unwrap();

        let fa: Vec<f64> = f_a.to_vec();
        let fb: Vec<f64> = f_b.to_vec();
        let fc: Vec<f64> = f_c.to_vec();
        for i in 0..fa.len() {
            assert!((fa[i] - fb[i]).abs() < 1e-10, "analytic vs autodiff at {}", i);
            assert!((fa[i] - fc[i]).abs() < 1e-3, "analytic vs finite diff at {}", i);
        }
        let ra: Vec<f64> = r_a.to_vec();
        let rb: Vec<f64> = r_b.to_vec();
        let rc: Vec<f64> = r_c.to_vec();
        for i in 0..ra.len() {
            assert!((ra[i] - rb[i]).abs() < 1e-10);
            assert!((ra[i] - rc[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_analytic_check_passes_on_consistent_jacobian() {
        let (device, client) = setup();
        let (x, u) = nominal(&device);
        let result =
            linearize_dynamics_impl(&client, &QuadDynamics, &x, &u, GradMethod::AnalyticCheck);
        assert!(result.is_ok());
    }

    #[test]
    fn test_affine_dynamics_linearization_is_exact() {
        let (device, client) = setup();
        // x_{t+1} = x + u exactly: residual must be ~0.
        struct LinearDynamics;
        impl Dynamics<CpuRuntime, CpuClient> for LinearDynamics {
            fn step(
                &self,
                client: &CpuClient,
                x: &Tensor<CpuRuntime>,
                u: &Tensor<CpuRuntime>,
            ) -> MpcResult<Tensor<CpuRuntime>> {
                Ok(client.add(x, u)?)
            }
        }
        let (x, u) = nominal(&device);
        let (_, resid) =
            linearize_dynamics_impl(&client, &LinearDynamics, &x, &u, GradMethod::FiniteDiff)
                .unwrap();
        let r: Vec<f64> = resid.to_vec();
        for v in r {
            assert!(v.abs() < 1e-9);
        }
    }
}
