//! One box-constrained LQR step: backward Riccati recursion with a per-step
//! box-QP, forward rollout with backtracking line search, and the
//! implicit-differentiation pass that produces gradients through the
//! converged fixed point.
//!
//! The recursion works in delta-space around a nominal `(x, u)` trajectory:
//! the linear cost term fed backward is the cost gradient at the nominal,
//! `C_t [x_t; u_t] + c_t`, so the feedforward terms `k_t` are control
//! increments and box bounds shift to `[u_lower - u_t, u_upper - u_t]`.

use numr::algorithm::linalg::LinearAlgebraAlgorithms;
use numr::dtype::DType;
use numr::ops::{BinaryOps, CompareOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::mpc::error::MpcResult;
use crate::mpc::impl_generic::pnqp::pnqp_impl;
use crate::mpc::impl_generic::utils::{
    at_t, batch_quad_obj, bger, bmm, bmv, bsolve, bsolve_mat, btranspose, clamp_tensor,
    ensure_finite, per_batch_norm, stack0,
};
use crate::mpc::traits::dynamics::Dynamics;
use crate::mpc::traits::{BackwardContext, MpcGradients};

const PNQP_MAX_ITER: usize = 20;

/// Per-invocation configuration of the LQR step, borrowed from the outer
/// solver's options.
pub struct LqrStepConfig<'a, R: Runtime> {
    pub n_state: usize,
    pub n_ctrl: usize,
    pub horizon: usize,
    /// Full `[T, B, n_ctrl]` bounds, both or neither.
    pub bounds: Option<(&'a Tensor<R>, &'a Tensor<R>)>,
    pub zero_mask: Option<&'a Tensor<R>>,
    pub delta_u: Option<f64>,
    pub linesearch_decay: f64,
    pub max_linesearch_iter: usize,
    pub back_eps: f64,
}

/// Gains from the backward recursion, one entry per timestep.
struct LqrGains<R: Runtime> {
    /// Feedback gains `K_t: [B, n_ctrl, n_state]`.
    kks: Vec<Tensor<R>>,
    /// Feedforward increments `k_t: [B, n_ctrl]`.
    ks: Vec<Tensor<R>>,
    qp_iters: usize,
}

/// Result of a full backward + forward LQR step.
pub struct LqrStepOutput<R: Runtime> {
    pub x: Tensor<R>,
    pub u: Tensor<R>,
    /// Realized quadratic cost per batch element, `[B]`.
    pub costs: Tensor<R>,
    /// Norm of the unscaled control step per batch element, measured on the
    /// alpha = 1 line-search trial. The outer solver's convergence signal.
    pub full_du_norm: Vec<f64>,
    pub mean_alpha: f64,
    pub qp_iters: usize,
}

/// Cost gradient along the nominal trajectory, `C_t [x_t; u_t] + c_t`,
/// stacked to `[T, B, n_tau]`.
fn delta_linear_term<R, C>(
    client: &C,
    c_mat: &Tensor<R>,
    c_vec: &Tensor<R>,
    x: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let horizon = x.shape()[0];
    let mut terms: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    for t in 0..horizon {
        let tau = client.cat(&[&at_t(x, t)?, &at_t(u, t)?], 1)?;
        let grad = client.add(&bmv(client, &at_t(c_mat, t)?, &tau)?, &at_t(c_vec, t)?)?;
        terms.push(grad);
    }
    stack0(client, &terms)
}

/// Backward Riccati recursion in delta-space.
///
/// `c_back` is the delta-space linear term from [`delta_linear_term`] (or the
/// injected loss gradient in the companion solve). Bounds are box constraints
/// on the absolute controls, shifted internally by the nominal `u`.
#[allow(clippy::too_many_arguments)]
fn lqr_backward<R, C>(
    client: &C,
    cfg: &LqrStepConfig<'_, R>,
    c_mat: &Tensor<R>,
    c_back: &Tensor<R>,
    f_mat: Option<&Tensor<R>>,
    nominal_u: &Tensor<R>,
) -> MpcResult<LqrGains<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
{
    let (n_state, n_ctrl, horizon) = (cfg.n_state, cfg.n_ctrl, cfg.horizon);
    let n_batch = nominal_u.shape()[1];

    let mut kks: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    let mut ks: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    let mut qp_iters = 0usize;

    let ones = client.fill(&[n_batch, n_ctrl], 1.0, DType::F64)?;
    let eye_uu = client
        .eye(n_ctrl, None, DType::F64)?
        .unsqueeze(0)?
        .broadcast_to(&[n_batch, n_ctrl, n_ctrl])?
        .contiguous();

    let mut v_mat: Option<Tensor<R>> = None;
    let mut v_vec: Option<Tensor<R>> = None;
    let mut prev_kt: Option<Tensor<R>> = None;

    for t in (0..horizon).rev() {
        let (kt_mat, kt_vec) = if t == horizon - 1 {
            (at_t(c_mat, t)?, at_t(c_back, t)?)
        } else {
            let f_t = at_t(f_mat.expect("multi-stage problem carries dynamics"), t)?;
            let f_t_tr = btranspose(&f_t)?;
            let vtp1 = v_mat.as_ref().expect("value function from t+1");
            let vvec = v_vec.as_ref().expect("value vector from t+1");
            let mat = client.add(
                &at_t(c_mat, t)?,
                &bmm(client, &bmm(client, &f_t_tr, vtp1)?, &f_t)?,
            )?;
            let vec = client.add(&at_t(c_back, t)?, &bmv(client, &f_t_tr, vvec)?)?;
            (mat, vec)
        };
        ensure_finite(&kt_vec, "Riccati recursion")?;

        let kt_xx = kt_mat.narrow(1, 0, n_state)?.narrow(2, 0, n_state)?.contiguous();
        let kt_xu = kt_mat
            .narrow(1, 0, n_state)?
            .narrow(2, n_state, n_ctrl)?
            .contiguous();
        let kt_ux = kt_mat
            .narrow(1, n_state, n_ctrl)?
            .narrow(2, 0, n_state)?
            .contiguous();
        let kt_uu = kt_mat
            .narrow(1, n_state, n_ctrl)?
            .narrow(2, n_state, n_ctrl)?
            .contiguous();
        let kt_x = kt_vec.narrow(1, 0, n_state)?.contiguous();
        let kt_u = kt_vec.narrow(1, n_state, n_ctrl)?.contiguous();

        let zero_t = match cfg.zero_mask {
            Some(z) => Some(at_t(z, t)?),
            None => None,
        };

        let (k, kk) = match cfg.bounds {
            None => {
                // Unconstrained Newton step, with held-zero dims excluded by
                // the same masking the QP path uses.
                let (h_eff, g_eff, ux_eff) = match &zero_t {
                    Some(z) => {
                        let free = client.sub(&ones, z)?;
                        let ff = bger(client, &free, &free)?;
                        let z_diag = client.mul(
                            &eye_uu,
                            &z.unsqueeze(2)?.broadcast_to(&[n_batch, n_ctrl, n_ctrl])?,
                        )?;
                        let h_eff = client.add(&client.mul(&kt_uu, &ff)?, &z_diag)?;
                        let g_eff = client.mul(&kt_u, &free)?;
                        let ux_eff = client.mul(
                            &kt_ux,
                            &free
                                .unsqueeze(2)?
                                .broadcast_to(&[n_batch, n_ctrl, n_state])?,
                        )?;
                        (h_eff, g_eff, ux_eff)
                    }
                    None => (kt_uu.clone(), kt_u.clone(), kt_ux.clone()),
                };
                let k = client.mul_scalar(
                    &bsolve(client, &h_eff, &g_eff, "Riccati control solve")?,
                    -1.0,
                )?;
                let kk = client.mul_scalar(
                    &bsolve_mat(client, &h_eff, &ux_eff, "Riccati gain solve")?,
                    -1.0,
                )?;
                (k, kk)
            }
            Some((lower, upper)) => {
                let u_t = at_t(nominal_u, t)?;
                let mut lb = client.sub(&at_t(lower, t)?, &u_t)?;
                let mut ub = client.sub(&at_t(upper, t)?, &u_t)?;
                if let Some(delta) = cfg.delta_u {
                    let neg = client.fill(&[n_batch, n_ctrl], -delta, DType::F64)?;
                    let pos = client.fill(&[n_batch, n_ctrl], delta, DType::F64)?;
                    lb = client.maximum(&lb, &neg)?;
                    ub = client.minimum(&ub, &pos)?;
                }

                let sol = pnqp_impl(
                    client,
                    &kt_uu,
                    &kt_u,
                    &lb,
                    &ub,
                    prev_kt.as_ref(),
                    zero_t.as_ref(),
                    cfg.back_eps,
                    PNQP_MAX_ITER,
                )?;
                qp_iters += sol.iterations + 1;
                prev_kt = Some(sol.x.clone());

                let ux_masked = client.mul(
                    &kt_ux,
                    &sol.free_mask
                        .unsqueeze(2)?
                        .broadcast_to(&[n_batch, n_ctrl, n_state])?,
                )?;
                let kk = client.mul_scalar(
                    &bsolve_mat(client, &sol.h_masked, &ux_masked, "Riccati gain solve")?,
                    -1.0,
                )?;
                (sol.x, kk)
            }
        };

        // Value function update, then symmetrize.
        let kk_tr = btranspose(&kk)?;
        let kt_uu_kk = bmm(client, &kt_uu, &kk)?;
        let vt = client.add(
            &client.add(&kt_xx, &bmm(client, &kt_xu, &kk)?)?,
            &client.add(
                &bmm(client, &kk_tr, &kt_ux)?,
                &bmm(client, &kk_tr, &kt_uu_kk)?,
            )?,
        )?;
        let vt = client.mul_scalar(&client.add(&vt, &btranspose(&vt)?)?, 0.5)?;
        let vvec = client.add(
            &client.add(&kt_x, &bmv(client, &kt_xu, &k)?)?,
            &client.add(
                &bmv(client, &kk_tr, &kt_u)?,
                &bmv(client, &bmm(client, &kk_tr, &kt_uu)?, &k)?,
            )?,
        )?;

        kks.push(kk);
        ks.push(k);
        v_mat = Some(vt);
        v_vec = Some(vvec);
    }

    kks.reverse();
    ks.reverse();
    Ok(LqrGains { kks, ks, qp_iters })
}

/// Forward rollout with a per-batch-element backtracking line search.
///
/// A batch element whose candidate cost does not improve on the nominal cost
/// gets its step size multiplied by the decay factor and the whole candidate
/// is rebuilt; elements that already improved keep their step size, so one
/// element's retries never affect another's. The candidate of the last
/// attempt is returned even for elements that never improved; the outer
/// solver's best-trajectory record protects against adopting it.
#[allow(clippy::too_many_arguments)]
fn lqr_forward<R, C, D>(
    client: &C,
    cfg: &LqrStepConfig<'_, R>,
    x_init: &Tensor<R>,
    c_mat: &Tensor<R>,
    c_vec: &Tensor<R>,
    f_mat: Option<&Tensor<R>>,
    f_vec: Option<&Tensor<R>>,
    dynamics: Option<&D>,
    nominal_x: &Tensor<R>,
    nominal_u: &Tensor<R>,
    gains: &LqrGains<R>,
) -> MpcResult<LqrStepOutput<R>>
where
    R: Runtime,
    C: TensorOps<R> + ScalarOps<R> + BinaryOps<R> + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    let (n_ctrl, horizon) = (cfg.n_ctrl, cfg.horizon);
    let n_batch = x_init.shape()[0];

    let old_cost: Vec<f64> = {
        let mut total = client.fill(&[n_batch], 0.0, DType::F64)?;
        for t in 0..horizon {
            let tau = client.cat(&[&at_t(nominal_x, t)?, &at_t(nominal_u, t)?], 1)?;
            let stage = batch_quad_obj(client, &at_t(c_mat, t)?, &at_t(c_vec, t)?, &tau)?;
            total = client.add(&total, &stage)?;
        }
        total.to_vec()
    };

    let mut alphas = vec![1.0f64; n_batch];
    let mut full_du_norm: Option<Vec<f64>> = None;
    let mut result: Option<(Tensor<R>, Tensor<R>, Tensor<R>)> = None;

    for attempt in 0..cfg.max_linesearch_iter {
        let alpha_t = Tensor::<R>::from_slice(&alphas, &[n_batch, 1], x_init.device())
            .broadcast_to(&[n_batch, n_ctrl])?
            .contiguous();

        let mut new_xs: Vec<Tensor<R>> = Vec::with_capacity(horizon);
        let mut new_us: Vec<Tensor<R>> = Vec::with_capacity(horizon);
        let mut cost = client.fill(&[n_batch], 0.0, DType::F64)?;
        new_xs.push(x_init.clone());

        for t in 0..horizon {
            let x_t = at_t(nominal_x, t)?;
            let u_t = at_t(nominal_u, t)?;
            let dxt = client.sub(&new_xs[t], &x_t)?;
            let mut new_ut = client.add(
                &client.add(&u_t, &bmv(client, &gains.kks[t], &dxt)?)?,
                &client.mul(&alpha_t, &gains.ks[t])?,
            )?;

            if let Some((lower, upper)) = cfg.bounds {
                let mut lb = at_t(lower, t)?;
                let mut ub = at_t(upper, t)?;
                if let Some(delta) = cfg.delta_u {
                    lb = client.maximum(&lb, &client.add_scalar(&u_t, -delta)?)?;
                    ub = client.minimum(&ub, &client.add_scalar(&u_t, delta)?)?;
                }
                new_ut = clamp_tensor(client, &new_ut, &lb, &ub)?;
            }
            if let Some(z) = cfg.zero_mask {
                let z_t = at_t(z, t)?;
                let keep = client.add_scalar(&client.mul_scalar(&z_t, -1.0)?, 1.0)?;
                new_ut = client.mul(&new_ut, &keep)?;
            }

            let tau = client.cat(&[&new_xs[t], &new_ut], 1)?;
            let stage = batch_quad_obj(client, &at_t(c_mat, t)?, &at_t(c_vec, t)?, &tau)?;
            cost = client.add(&cost, &stage)?;

            if t < horizon - 1 {
                let next = match dynamics {
                    Some(dyn_fn) => dyn_fn.step(client, &new_xs[t], &new_ut)?,
                    None => {
                        let f_t = at_t(f_mat.expect("affine rollout needs dynamics"), t)?;
                        let mut n = bmv(client, &f_t, &tau)?;
                        if let Some(fv) = f_vec {
                            n = client.add(&n, &at_t(fv, t)?)?;
                        }
                        n
                    }
                };
                new_xs.push(next);
            }
            new_us.push(new_ut);
        }

        let new_u = stack0(client, &new_us)?;
        let new_x = stack0(client, &new_xs)?;

        if full_du_norm.is_none() {
            // First attempt runs every element at alpha = 1; this is the
            // convergence signal.
            let du = client.sub(nominal_u, &new_u)?;
            full_du_norm = Some(per_batch_norm(client, &du)?);
        }

        let cost_vals: Vec<f64> = cost.to_vec();
        let improved: Vec<bool> = cost_vals
            .iter()
            .zip(old_cost.iter())
            .map(|(&new, &old)| new <= old)
            .collect();
        result = Some((new_x, new_u, cost));
        if improved.iter().all(|&b| b) || attempt == cfg.max_linesearch_iter - 1 {
            break;
        }
        for (alpha, &ok) in alphas.iter_mut().zip(improved.iter()) {
            if !ok {
                *alpha *= cfg.linesearch_decay;
            }
        }
    }

    let (x, u, costs) = result.expect("at least one line-search attempt");
    let mean_alpha = alphas.iter().sum::<f64>() / n_batch as f64;
    Ok(LqrStepOutput {
        x,
        u,
        costs,
        full_du_norm: full_du_norm.unwrap_or_else(|| vec![0.0; n_batch]),
        mean_alpha,
        qp_iters: gains.qp_iters,
    })
}

/// One full LQR step around the nominal `(x, u)`: backward recursion in
/// delta-space, then the line-searched forward rollout.
#[allow(clippy::too_many_arguments)]
pub fn lqr_step_impl<R, C, D>(
    client: &C,
    cfg: &LqrStepConfig<'_, R>,
    x_init: &Tensor<R>,
    c_mat: &Tensor<R>,
    c_vec: &Tensor<R>,
    f_mat: Option<&Tensor<R>>,
    f_vec: Option<&Tensor<R>>,
    dynamics: Option<&D>,
    nominal_x: &Tensor<R>,
    nominal_u: &Tensor<R>,
) -> MpcResult<LqrStepOutput<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    let c_back = delta_linear_term(client, c_mat, c_vec, nominal_x, nominal_u)?;
    let gains = lqr_backward(client, cfg, c_mat, &c_back, f_mat, nominal_u)?;
    lqr_forward(
        client, cfg, x_init, c_mat, c_vec, f_mat, f_vec, dynamics, nominal_x, nominal_u, &gains,
    )
}

/// Gradients of a scalar loss through the converged fixed point.
///
/// Solves one companion LQR problem on the KKT system at the optimum: same
/// quadratic cost and dynamics Jacobians, the incoming loss gradient as the
/// linear cost term, zero residual and zero initial state, and every control
/// dimension that finished on a bound held at zero. The companion solution
/// `p` and the costate recursions then give the gradients in closed form.
pub(crate) fn lqr_grad_impl<R, C>(
    client: &C,
    ctx: &BackwardContext<R>,
    dl_dx: &Tensor<R>,
    dl_du: &Tensor<R>,
) -> MpcResult<MpcGradients<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
{
    let (n_state, n_ctrl, horizon, n_batch) =
        (ctx.n_state, ctx.n_ctrl, ctx.horizon, ctx.n_batch);
    let n_tau = n_state + n_ctrl;

    // Loss gradient per stage, with detached batch elements zeroed out.
    let mut r = client.cat(&[dl_dx, dl_du], 2)?;
    if ctx.grad_mask.iter().any(|&m| m == 0.0) {
        let mask = Tensor::<R>::from_slice(&ctx.grad_mask, &[1, n_batch, 1], r.device())
            .broadcast_to(&[horizon, n_batch, n_tau])?;
        r = client.mul(&r, &mask)?;
    }

    // Dimensions active at the optimum are held at zero in the companion
    // problem, so they carry no sensitivity.
    let active = match &ctx.free_mask {
        Some(free) => Some(client.add_scalar(&client.mul_scalar(free, -1.0)?, 1.0)?),
        None => None,
    };

    let companion_cfg = LqrStepConfig {
        n_state,
        n_ctrl,
        horizon,
        bounds: None,
        zero_mask: active.as_ref(),
        delta_u: None,
        linesearch_decay: 1.0,
        max_linesearch_iter: 1,
        back_eps: ctx.back_eps,
    };

    let zero_x = client.fill(&[horizon, n_batch, n_state], 0.0, DType::F64)?;
    let zero_u = client.fill(&[horizon, n_batch, n_ctrl], 0.0, DType::F64)?;
    let zero_init = client.fill(&[n_batch, n_state], 0.0, DType::F64)?;

    // Around a zero nominal, the delta-space linear term is exactly r.
    let gains = lqr_backward(
        client,
        &companion_cfg,
        &ctx.c_mat,
        &r,
        ctx.f_mat.as_ref(),
        &zero_u,
    )?;
    let companion = lqr_forward::<R, C, crate::mpc::traits::dynamics::NoDynamics>(
        client,
        &companion_cfg,
        &zero_init,
        &ctx.c_mat,
        &r,
        ctx.f_mat.as_ref(),
        None,
        None,
        &zero_x,
        &zero_u,
        &gains,
    )?;

    let p = client.cat(&[&companion.x, &companion.u], 2)?;
    let tau = client.cat(&[&ctx.x, &ctx.u], 2)?;

    // dC_t = 0.5 (p_t tau_t' + tau_t p_t'), dc_t = p_t.
    let p_flat = p.reshape(&[horizon * n_batch, n_tau])?;
    let tau_flat = tau.reshape(&[horizon * n_batch, n_tau])?;
    let outer = bger(client, &p_flat, &tau_flat)?;
    let dc_mat = client
        .mul_scalar(
            &client.add(&outer, &btranspose(&outer)?)?,
            0.5,
        )?
        .reshape(&[horizon, n_batch, n_tau, n_tau])?;
    let dc_vec = p.clone();

    // Costate recursions for the original and the companion problem.
    let mut lams: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    let mut dlams: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    let mut lam_next: Option<Tensor<R>> = None;
    let mut dlam_next: Option<Tensor<R>> = None;
    for t in (0..horizon).rev() {
        let tau_t = at_t(&tau, t)?;
        let p_t = at_t(&p, t)?;
        let c_mat_t = at_t(&ctx.c_mat, t)?;
        let gx = client
            .add(&bmv(client, &c_mat_t, &tau_t)?, &at_t(&ctx.c_vec, t)?)?
            .narrow(1, 0, n_state)?
            .contiguous();
        let gpx = client
            .add(&bmv(client, &c_mat_t, &p_t)?, &at_t(&r, t)?)?
            .narrow(1, 0, n_state)?
            .contiguous();
        let (lam, dlam) = match (&lam_next, &dlam_next) {
            (Some(ln), Some(dln)) => {
                let f_x = at_t(ctx.f_mat.as_ref().expect("multi-stage costate"), t)?
                    .narrow(2, 0, n_state)?
                    .contiguous();
                let f_x_tr = btranspose(&f_x)?;
                (
                    client.sub(&bmv(client, &f_x_tr, ln)?, &gx)?,
                    client.sub(&bmv(client, &f_x_tr, dln)?, &gpx)?,
                )
            }
            _ => (
                client.mul_scalar(&gx, -1.0)?,
                client.mul_scalar(&gpx, -1.0)?,
            ),
        };
        lams.push(lam.clone());
        dlams.push(dlam.clone());
        lam_next = Some(lam);
        dlam_next = Some(dlam);
    }
    lams.reverse();
    dlams.reverse();

    // dF_t = -(dlam_{t+1} tau_t' + lam_{t+1} p_t'), df_t = -dlam_{t+1}.
    let (df_mat, df_vec) = if horizon > 1 {
        let mut dfs: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
        let mut dfvs: Vec<Tensor<R>> = Vec::with_capacity(horizon - 1);
        for t in 0..horizon - 1 {
            let term = client.add(
                &bger(client, &dlams[t + 1], &at_t(&tau, t)?)?,
                &bger(client, &lams[t + 1], &at_t(&p, t)?)?,
            )?;
            dfs.push(client.mul_scalar(&term, -1.0)?);
            dfvs.push(client.mul_scalar(&dlams[t + 1], -1.0)?);
        }
        (
            Some(stack0(client, &dfs)?),
            if ctx.f_vec.is_some() {
                Some(stack0(client, &dfvs)?)
            } else {
                None
            },
        )
    } else {
        (None, None)
    };

    let dx_init = client.mul_scalar(&dlams[0], -1.0)?;

    Ok(MpcGradients {
        dc_mat,
        dc_vec,
        df_mat,
        df_vec,
        dx_init,
    })
}
