//! The outer fixed-point solver: iterated linearization and box-constrained
//! LQR steps with per-batch-element best-trajectory tracking, plus the
//! slew-rate augmentation wrapper and the gradient entry point.

use numr::algorithm::linalg::LinearAlgebraAlgorithms;
use numr::dtype::DType;
use numr::ops::{BinaryOps, CompareOps, ScalarOps, TensorOps, UnaryOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::{debug, warn};

use crate::mpc::error::{MpcError, MpcResult};
use crate::mpc::impl_generic::linearize::linearize_dynamics_impl;
use crate::mpc::impl_generic::lqr_step::{lqr_step_impl, LqrStepConfig};
use crate::mpc::impl_generic::utils::{
    rollout_affine, select_batch_columns, stack0,
};
use crate::mpc::traits::dynamics::{CtrlPassthroughDynamics, Dynamics, DynamicsModel};
use crate::mpc::traits::{
    BackwardContext, BatchOutcome, Bound, MpcDiagnostics, MpcGradients, MpcOptions, MpcSolution,
    QuadCost,
};

const ACTIVE_BOUND_TOL: f64 = 1e-8;

/// Solve the box-constrained control problem described by `options`.
pub fn mpc_impl<R, C, D>(
    client: &C,
    cost: &QuadCost<R>,
    x_init: &Tensor<R>,
    dynamics: DynamicsModel<'_, R, D>,
    options: &MpcOptions<R>,
) -> MpcResult<MpcSolution<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + UnaryOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
    R::Client: TensorOps<R>,
    D: Dynamics<R, C>,
{
    validate_options(options)?;

    let Some(penalty) = options.slew_rate_penalty else {
        return solve_inner(client, cost, x_init, dynamics, options, None);
    };

    // Slew-rate penalty: solve in the augmented state [u_{t-1}, x_t] with the
    // control passed through the dynamics, then slice the original state back
    // out. The penalty couples consecutive controls through the augmented
    // quadratic cost.
    let DynamicsModel::Nonlinear(inner) = dynamics else {
        return Err(MpcError::Unimplemented {
            feature: "slew-rate penalty with precomputed affine dynamics".to_string(),
        });
    };

    let n_batch = infer_n_batch(&cost.c_mat, options)?;
    let (n_state, n_ctrl, horizon) = (options.n_state, options.n_ctrl, options.horizon);
    let n_tau = n_state + n_ctrl;
    let aug_state = n_ctrl + n_state;
    let aug_tau = aug_state + n_ctrl;

    let c_mat = broadcast_cost_mat(&cost.c_mat, n_batch, horizon, n_tau)?;
    let c_vec = broadcast_cost_vec(&cost.c_vec, n_batch, horizon, n_tau)?;

    // Augmented quadratic: the slew block on the previous- and
    // current-control corners, the user cost shifted into the bottom-right.
    let mut slew_host = vec![0.0f64; aug_tau * aug_tau];
    for i in 0..n_ctrl {
        let j = aug_tau - n_ctrl + i;
        slew_host[i * aug_tau + i] = penalty;
        slew_host[j * aug_tau + j] = penalty;
        slew_host[i * aug_tau + j] = -penalty;
        slew_host[j * aug_tau + i] = -penalty;
    }
    let slew_block = Tensor::<R>::from_slice(&slew_host, &[1, 1, aug_tau, aug_tau], x_init.device())
        .broadcast_to(&[horizon, n_batch, aug_tau, aug_tau])?;

    let pad_left = client.fill(&[horizon, n_batch, n_tau, n_ctrl], 0.0, DType::F64)?;
    let padded_cols = client.cat(&[&pad_left, &c_mat], 3)?;
    let pad_top = client.fill(&[horizon, n_batch, n_ctrl, aug_tau], 0.0, DType::F64)?;
    let padded = client.cat(&[&pad_top, &padded_cols], 2)?;
    let aug_c_mat = client.add(&padded, &slew_block)?;

    let c_pad = client.fill(&[horizon, n_batch, n_ctrl], 0.0, DType::F64)?;
    let aug_c_vec = client.cat(&[&c_pad, &c_vec], 2)?;

    let prev_u = match &options.prev_ctrl {
        Some(p) => p.clone(),
        None => client.fill(&[n_batch, n_ctrl], 0.0, DType::F64)?,
    };
    let aug_x_init = client.cat(&[&prev_u, x_init], 1)?;

    let wrapped = CtrlPassthroughDynamics::new(inner, n_ctrl);
    let mut aug_options = options.clone();
    aug_options.n_state = aug_state;
    aug_options.slew_rate_penalty = None;
    aug_options.prev_ctrl = None;
    aug_options.n_batch = Some(n_batch);

    let aug_cost = QuadCost {
        c_mat: aug_c_mat,
        c_vec: aug_c_vec,
    };
    let mut solution = solve_inner(
        client,
        &aug_cost,
        &aug_x_init,
        DynamicsModel::Nonlinear(&wrapped),
        &aug_options,
        Some(n_state),
    )?;

    let raw_x = solution.x.narrow(2, n_ctrl, n_state)?.contiguous();
    solution.x = raw_x;
    Ok(solution)
}

/// Gradients of a scalar loss through a finished solve.
pub fn mpc_grad_impl<R, C>(
    client: &C,
    solution: &MpcSolution<R>,
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
    let ctx = &solution.backward;
    let Some(raw_n_state) = ctx.slew_raw_n_state else {
        return crate::mpc::impl_generic::lqr_step::lqr_grad_impl(client, ctx, dl_dx, dl_du);
    };

    // The context holds the augmented problem; lift the state sensitivity
    // into augmented coordinates (zero on the previous-control block), then
    // slice the gradients back down.
    let n_ctrl = ctx.n_ctrl;
    let raw_tau = raw_n_state + n_ctrl;
    let pad = client.fill(
        &[ctx.horizon, ctx.n_batch, n_ctrl],
        0.0,
        DType::F64,
    )?;
    let dl_dx_aug = client.cat(&[&pad, dl_dx], 2)?;
    let grads =
        crate::mpc::impl_generic::lqr_step::lqr_grad_impl(client, ctx, &dl_dx_aug, dl_du)?;

    let dc_mat = grads
        .dc_mat
        .narrow(2, n_ctrl, raw_tau)?
        .narrow(3, n_ctrl, raw_tau)?
        .contiguous();
    let dc_vec = grads.dc_vec.narrow(2, n_ctrl, raw_tau)?.contiguous();
    let df_mat = match grads.df_mat {
        Some(df) => Some(
            df.narrow(2, n_ctrl, raw_n_state)?
                .narrow(3, n_ctrl, raw_tau)?
                .contiguous(),
        ),
        None => None,
    };
    let df_vec = match grads.df_vec {
        Some(dfv) => Some(dfv.narrow(2, n_ctrl, raw_n_state)?.contiguous()),
        None => None,
    };
    let dx_init = grads.dx_init.narrow(1, n_ctrl, raw_n_state)?.contiguous();

    Ok(MpcGradients {
        dc_mat,
        dc_vec,
        df_mat,
        df_vec,
        dx_init,
    })
}

fn validate_options<R: Runtime>(options: &MpcOptions<R>) -> MpcResult<()> {
    if options.horizon == 0 {
        return Err(MpcError::Config {
            message: "horizon must be at least 1".to_string(),
        });
    }
    if options.lqr_iter == 0 {
        return Err(MpcError::Config {
            message: "lqr_iter must be at least 1".to_string(),
        });
    }
    if options.max_linesearch_iter == 0 {
        return Err(MpcError::Config {
            message: "max_linesearch_iter must be at least 1".to_string(),
        });
    }
    if options.u_lower.is_some() != options.u_upper.is_some() {
        return Err(MpcError::Config {
            message: "u_lower and u_upper must be given together or not at all".to_string(),
        });
    }
    Ok(())
}

fn infer_n_batch<R: Runtime>(c_mat: &Tensor<R>, options: &MpcOptions<R>) -> MpcResult<usize> {
    if c_mat.ndim() == 4 {
        Ok(c_mat.shape()[1])
    } else if let Some(n_batch) = options.n_batch {
        Ok(n_batch)
    } else {
        Err(MpcError::Config {
            message: "could not infer the batch size; set n_batch".to_string(),
        })
    }
}

fn broadcast_cost_mat<R: Runtime>(
    c_mat: &Tensor<R>,
    n_batch: usize,
    horizon: usize,
    n_tau: usize,
) -> MpcResult<Tensor<R>> {
    if c_mat.ndim() == 3 {
        Ok(c_mat
            .unsqueeze(1)?
            .broadcast_to(&[horizon, n_batch, n_tau, n_tau])?
            .contiguous())
    } else {
        Ok(c_mat.clone())
    }
}

fn broadcast_cost_vec<R: Runtime>(
    c_vec: &Tensor<R>,
    n_batch: usize,
    horizon: usize,
    n_tau: usize,
) -> MpcResult<Tensor<R>> {
    if c_vec.ndim() == 2 {
        Ok(c_vec
            .unsqueeze(1)?
            .broadcast_to(&[horizon, n_batch, n_tau])?
            .contiguous())
    } else {
        Ok(c_vec.clone())
    }
}

fn materialize_bound<R, C>(
    client: &C,
    bound: &Bound<R>,
    horizon: usize,
    n_batch: usize,
    n_ctrl: usize,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    match bound {
        Bound::Scalar(v) => Ok(client.fill(&[horizon, n_batch, n_ctrl], *v, DType::F64)?),
        Bound::Full(t) => Ok(t.clone()),
    }
}

fn rollout_nonlinear<R, C, D>(
    client: &C,
    dynamics: &D,
    x_init: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    let horizon = u.shape()[0];
    let mut states: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    states.push(x_init.clone());
    for t in 0..horizon - 1 {
        let u_t = crate::mpc::impl_generic::utils::at_t(u, t)?;
        let next = dynamics.step(client, &states[t], &u_t)?;
        states.push(next);
    }
    stack0(client, &states)
}

/// Per-batch-element record of the lowest-cost trajectory seen so far.
struct BestRecord<R: Runtime> {
    x: Tensor<R>,
    u: Tensor<R>,
    costs: Vec<f64>,
}

#[allow(clippy::too_many_arguments)]
fn solve_inner<R, C, D>(
    client: &C,
    cost: &QuadCost<R>,
    x_init: &Tensor<R>,
    dynamics: DynamicsModel<'_, R, D>,
    options: &MpcOptions<R>,
    slew_raw_n_state: Option<usize>,
) -> MpcResult<MpcSolution<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + UnaryOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
    R::Client: TensorOps<R>,
    D: Dynamics<R, C>,
{
    let (n_state, n_ctrl, horizon) = (options.n_state, options.n_ctrl, options.horizon);
    let n_tau = n_state + n_ctrl;
    let n_batch = infer_n_batch(&cost.c_mat, options)?;

    if x_init.ndim() != 2 || x_init.shape() != [n_batch, n_state] {
        return Err(MpcError::Config {
            message: format!(
                "x_init must be [{}, {}], got {:?}",
                n_batch,
                n_state,
                x_init.shape()
            ),
        });
    }

    let c_mat = broadcast_cost_mat(&cost.c_mat, n_batch, horizon, n_tau)?;
    let c_vec = broadcast_cost_vec(&cost.c_vec, n_batch, horizon, n_tau)?;

    let bounds = match (&options.u_lower, &options.u_upper) {
        (Some(lo), Some(hi)) => Some((
            materialize_bound(client, lo, horizon, n_batch, n_ctrl)?,
            materialize_bound(client, hi, horizon, n_batch, n_ctrl)?,
        )),
        _ => None,
    };

    let mut u = match &options.u_init {
        Some(u0) if u0.ndim() == 2 => u0
            .unsqueeze(1)?
            .broadcast_to(&[horizon, n_batch, n_ctrl])?
            .contiguous(),
        Some(u0) => u0.clone(),
        None => client.fill(&[horizon, n_batch, n_ctrl], 0.0, DType::F64)?,
    };

    let cfg_bounds = bounds.as_ref().map(|(lo, hi)| (lo, hi));
    let cfg = LqrStepConfig {
        n_state,
        n_ctrl,
        horizon,
        bounds: cfg_bounds,
        zero_mask: options.u_zero_mask.as_ref(),
        delta_u: options.delta_u,
        linesearch_decay: options.linesearch_decay,
        max_linesearch_iter: options.max_linesearch_iter,
        back_eps: options.back_eps,
    };

    let mut best: Option<BestRecord<R>> = None;
    let mut n_not_improved = vec![0usize; n_batch];
    let mut total_qp_iters = 0usize;
    let mut mean_alpha = 1.0f64;
    let mut iterations = 0usize;
    let mut last_du_norm = vec![f64::INFINITY; n_batch];
    let mut f_mat_cur: Option<Tensor<R>> = None;
    let mut f_vec_cur: Option<Tensor<R>> = None;

    for iter in 0..options.lqr_iter {
        iterations = iter + 1;

        // Nominal rollout under the current controls, then a fresh
        // linearization when the dynamics are nonlinear.
        let (x, true_dynamics): (Tensor<R>, Option<&D>) = match dynamics {
            DynamicsModel::Nonlinear(d) => {
                let x = rollout_nonlinear(client, d, x_init, &u)?;
                if horizon > 1 {
                    let (fm, fv) =
                        linearize_dynamics_impl(client, d, &x, &u, options.grad_method)?;
                    f_mat_cur = Some(fm);
                    f_vec_cur = Some(fv);
                }
                (x, Some(d))
            }
            DynamicsModel::Affine { f_mat, f_vec } => {
                f_mat_cur = Some(f_mat.clone());
                f_vec_cur = f_vec.cloned();
                (rollout_affine(client, f_mat, f_vec, x_init, &u)?, None)
            }
        };

        let step = lqr_step_impl(
            client,
            &cfg,
            x_init,
            &c_mat,
            &c_vec,
            f_mat_cur.as_ref(),
            f_vec_cur.as_ref(),
            true_dynamics,
            &x,
            &u,
        )?;
        total_qp_iters += step.qp_iters;
        mean_alpha = step.mean_alpha;
        last_du_norm = step.full_du_norm.clone();

        let step_costs: Vec<f64> = step.costs.to_vec();
        match &mut best {
            None => {
                best = Some(BestRecord {
                    x: step.x.clone(),
                    u: step.u.clone(),
                    costs: step_costs.clone(),
                });
            }
            Some(record) => {
                // Per-element adoption with a per-element plateau counter; one
                // element improving never resets another's counter.
                let adopt: Vec<bool> = step_costs
                    .iter()
                    .zip(record.costs.iter())
                    .map(|(&new, &old)| new <= old - options.best_cost_eps)
                    .collect();
                for (j, &a) in adopt.iter().enumerate() {
                    if a {
                        record.costs[j] = step_costs[j];
                        n_not_improved[j] = 0;
                    } else {
                        n_not_improved[j] += 1;
                    }
                }
                if adopt.iter().any(|&a| a) {
                    record.x = select_batch_columns(client, &record.x, &step.x, &adopt)?;
                    record.u = select_batch_columns(client, &record.u, &step.u, &adopt)?;
                }
            }
        }

        let best_ref = best.as_ref().expect("best record set on first iteration");
        debug!(
            "lqr iter {}: mean(cost) {:.4e}, max ||du|| {:.2e}, mean(alpha) {:.2e}, qp iters {}",
            iter,
            best_ref.costs.iter().sum::<f64>() / n_batch as f64,
            step.full_du_norm.iter().cloned().fold(0.0, f64::max),
            step.mean_alpha,
            step.qp_iters,
        );

        u = step.u;

        let max_du = step.full_du_norm.iter().cloned().fold(0.0, f64::max);
        let plateaued = n_not_improved.iter().any(|&n| n > options.not_improved_lim);
        if max_du < options.eps || plateaued {
            break;
        }
    }

    let best = best.expect("at least one outer iteration");
    let best_x = best.x;
    let best_u = best.u;

    // Re-linearize at the best trajectory so the saved problem data describes
    // the fixed point that gradients flow through.
    if let DynamicsModel::Nonlinear(d) = dynamics {
        if horizon > 1 {
            let (fm, fv) = linearize_dynamics_impl(client, d, &best_x, &best_u, options.grad_method)?;
            f_mat_cur = Some(fm);
            f_vec_cur = Some(fv);
        }
    }

    // Fixed-point status comes from the last iteration's full control step,
    // not the best record: the best trajectory is only re-adopted on a strict
    // cost improvement, so its recorded step norm can be stale.
    let max_du = last_du_norm.iter().cloned().fold(0.0, f64::max);
    let unconverged: Vec<bool> = last_du_norm.iter().map(|&n| n > options.eps).collect();
    if unconverged.iter().any(|&b| b) && options.exit_unconverged {
        return Err(MpcError::DidNotConverge {
            iterations,
            max_du_norm: max_du,
            tolerance: options.eps,
        });
    }

    let mut grad_mask = vec![1.0f64; n_batch];
    if unconverged.iter().any(|&b| b) && options.detach_unconverged {
        warn!(
            "{} of {} batch elements did not reach a fixed point; their gradients are detached",
            unconverged.iter().filter(|&&b| b).count(),
            n_batch
        );
        for (m, &bad) in grad_mask.iter_mut().zip(unconverged.iter()) {
            if bad {
                *m = 0.0;
            }
        }
    }
    let outcomes: Vec<BatchOutcome> = unconverged
        .iter()
        .map(|&bad| {
            if bad {
                BatchOutcome::Unconverged
            } else {
                BatchOutcome::Converged
            }
        })
        .collect();

    let free_mask = compute_free_mask(
        client,
        &best_u,
        bounds.as_ref(),
        options.u_zero_mask.as_ref(),
    )?;

    let costs = Tensor::<R>::from_slice(&best.costs, &[n_batch], x_init.device());

    let backward = BackwardContext {
        c_mat,
        c_vec,
        f_mat: f_mat_cur,
        f_vec: f_vec_cur,
        x: best_x.clone(),
        u: best_u.clone(),
        free_mask,
        grad_mask,
        n_state,
        n_ctrl,
        horizon,
        n_batch,
        back_eps: options.back_eps,
        slew_raw_n_state,
    };

    Ok(MpcSolution {
        x: best_x,
        u: best_u,
        costs,
        outcomes,
        diagnostics: MpcDiagnostics {
            iterations,
            total_qp_iters,
            mean_alpha,
            full_du_norm: last_du_norm,
        },
        backward,
    })
}

/// Mask of control dimensions free at the optimum: not within tolerance of a
/// bound and not pinned by the zero mask. `None` when nothing constrains the
/// controls.
fn compute_free_mask<R, C>(
    client: &C,
    u: &Tensor<R>,
    bounds: Option<&(Tensor<R>, Tensor<R>)>,
    zero_mask: Option<&Tensor<R>>,
) -> MpcResult<Option<Tensor<R>>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + UnaryOps<R>
        + RuntimeClient<R>,
{
    let shape = u.shape().to_vec();
    let at_bound = match bounds {
        Some((lower, upper)) => {
            let tol = client.fill(&shape, ACTIVE_BOUND_TOL, DType::F64)?;
            let at_lo = client.le(&client.abs(&client.sub(u, lower)?)?, &tol)?;
            let at_hi = client.le(&client.abs(&client.sub(u, upper)?)?, &tol)?;
            Some(client.maximum(&at_lo, &at_hi)?)
        }
        None => None,
    };
    let active = match (at_bound, zero_mask) {
        (Some(b), Some(z)) => client.maximum(&b, z)?,
        (Some(b), None) => b,
        (None, Some(z)) => z.clone(),
        (None, None) => return Ok(None),
    };
    let free = client.add_scalar(&client.mul_scalar(&active, -1.0)?, 1.0)?;
    Ok(Some(free))
}
