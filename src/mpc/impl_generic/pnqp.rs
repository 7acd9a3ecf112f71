//! Batched projected-Newton solver for box-constrained quadratics.
//!
//! Minimizes `0.5 x' H x + q' x` subject to `lower <= x <= upper` for a batch
//! of small independent problems, one per batch element. Called once per
//! timestep inside the Riccati recursion, where `H` is the control block of
//! the cost-to-go Hessian and the bounds are the box constraints shifted into
//! delta-space.

use numr::algorithm::linalg::LinearAlgebraAlgorithms;
use numr::dtype::DType;
use numr::ops::{BinaryOps, CompareOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use tracing::warn;

use crate::mpc::error::MpcResult;
use crate::mpc::impl_generic::utils::{batch_quad_obj, bger, bmv, bsolve, clamp_tensor, ensure_finite};

const ARMIJO_GAMMA: f64 = 0.1;
const ARMIJO_DECAY: f64 = 0.5;
const MAX_ARMIJO_ITER: usize = 10;
const STEP_TOL: f64 = 1e-4;
const DIAG_REG: f64 = 1e-11;

/// Outcome of a batched box-QP solve.
pub struct PnqpSolution<R: Runtime> {
    /// Minimizer, `[B, n]`, exactly inside the box.
    pub x: Tensor<R>,
    /// Hessian with active rows/columns replaced by identity, `[B, n, n]`.
    /// Reused by the caller to solve for feedback gains on the free set.
    pub h_masked: Tensor<R>,
    /// Free-dimension mask, `[B, n]`, 1 where no bound is active.
    pub free_mask: Tensor<R>,
    /// Projected-Newton iterations used.
    pub iterations: usize,
}

/// Solve the batched box-QP by projected Newton with an Armijo backtracking
/// line search.
///
/// `x_start` warm-starts the iteration; without it the clamped unconstrained
/// Newton point is used. Dimensions flagged in `held_zero` are pinned to zero
/// and treated as permanently active. A singular reduced system surfaces as
/// [`MpcError::IllConditioned`](crate::mpc::MpcError).
#[allow(clippy::too_many_arguments)]
pub fn pnqp_impl<R, C>(
    client: &C,
    h: &Tensor<R>,
    q: &Tensor<R>,
    lower: &Tensor<R>,
    upper: &Tensor<R>,
    x_start: Option<&Tensor<R>>,
    held_zero: Option<&Tensor<R>>,
    tol: f64,
    max_iter: usize,
) -> MpcResult<PnqpSolution<R>>
where
    R: Runtime,
    C: TensorOps<R>
        + ScalarOps<R>
        + BinaryOps<R>
        + CompareOps<R>
        + LinearAlgebraAlgorithms<R>
        + RuntimeClient<R>,
{
    let n_batch = h.shape()[0];
    let n = h.shape()[1];

    let eye_b = client
        .eye(n, None, DType::F64)?
        .unsqueeze(0)?
        .broadcast_to(&[n_batch, n, n])?
        .contiguous();
    let zeros = client.fill(&[n_batch, n], 0.0, DType::F64)?;
    let ones = client.fill(&[n_batch, n], 1.0, DType::F64)?;

    let mut x = match x_start {
        Some(x0) => x0.clone(),
        None => {
            let neg_q = client.mul_scalar(q, -1.0)?;
            bsolve(client, h, &neg_q, "box-QP start point")?
        }
    };
    x = clamp_tensor(client, &x, lower, upper)?;
    if let Some(z) = held_zero {
        let keep = client.sub(&ones, z)?;
        x = client.mul(&x, &keep)?;
    }

    for iter in 0..max_iter {
        let g = client.add(&bmv(client, h, &x)?, q)?;
        ensure_finite(&g, "box-QP gradient")?;

        // Active where a bound is touched and the gradient pushes outward.
        let at_lo = client.le(&x, lower)?;
        let at_hi = client.ge(&x, upper)?;
        let push_out = client.gt(&g, &zeros)?;
        let push_in = client.lt(&g, &zeros)?;
        let mut active = client.maximum(
            &client.mul(&at_lo, &push_out)?,
            &client.mul(&at_hi, &push_in)?,
        )?;
        if let Some(z) = held_zero {
            active = client.maximum(&active, z)?;
        }
        let free = client.sub(&ones, &active)?;

        let g_free = client.mul(&g, &free)?;

        // Free-free block, identity on active dims so their rows solve to 0.
        let ff = bger(client, &free, &free)?;
        let active_diag = client.mul(
            &eye_b,
            &active.unsqueeze(2)?.broadcast_to(&[n_batch, n, n])?,
        )?;
        let h_masked = client.add(
            &client.add(&client.mul(h, &ff)?, &active_diag)?,
            &client.mul_scalar(&eye_b, DIAG_REG)?,
        )?;

        let gf_sq = client.sum(&client.mul(&g_free, &g_free)?, &[1], false)?;
        let gf_norms: Vec<f64> = gf_sq.to_vec();
        if gf_norms.iter().all(|&s| s.sqrt() < tol) {
            return Ok(PnqpSolution {
                x,
                h_masked,
                free_mask: free,
                iterations: iter,
            });
        }

        let neg_gf = client.mul_scalar(&g_free, -1.0)?;
        let dx = bsolve(client, &h_masked, &neg_gf, "box-QP Newton step")?;

        let dx_sq = client.sum(&client.mul(&dx, &dx)?, &[1], false)?;
        let dx_norms: Vec<f64> = dx_sq.to_vec();
        if dx_norms.iter().all(|&s| s.sqrt() < STEP_TOL) {
            return Ok(PnqpSolution {
                x,
                h_masked,
                free_mask: free,
                iterations: iter,
            });
        }

        // Per-element Armijo backtracking on the projected step.
        let obj_x: Vec<f64> = batch_quad_obj(client, h, q, &x)?.to_vec();
        let mut alphas = vec![1.0f64; n_batch];
        let mut searching = vec![true; n_batch];
        let mut candidate = x.clone();
        for _ in 0..MAX_ARMIJO_ITER {
            let alpha_t = Tensor::<R>::from_slice(&alphas, &[n_batch, 1], x.device())
                .broadcast_to(&[n_batch, n])?;
            let trial = client.add(&x, &client.mul(&alpha_t, &dx)?)?;
            candidate = clamp_tensor(client, &trial, lower, upper)?;
            if let Some(z) = held_zero {
                let keep = client.sub(&ones, z)?;
                candidate = client.mul(&candidate, &keep)?;
            }
            let obj_new: Vec<f64> = batch_quad_obj(client, h, q, &candidate)?.to_vec();
            let descent: Vec<f64> = client
                .sum(
                    &client.mul(&g, &client.sub(&x, &candidate)?)?,
                    &[1],
                    false,
                )?
                .to_vec();
            let mut any_searching = false;
            for i in 0..n_batch {
                if !searching[i] {
                    continue;
                }
                let ratio = if descent[i] > 0.0 {
                    (obj_x[i] - obj_new[i]) / descent[i]
                } else {
                    0.0
                };
                if ratio > ARMIJO_GAMMA {
                    searching[i] = false;
                } else {
                    alphas[i] *= ARMIJO_DECAY;
                    any_searching = true;
                }
            }
            if !any_searching {
                break;
            }
        }
        x = candidate;
    }

    warn!("box-QP projected Newton did not converge in {} iterations", max_iter);

    // Recompute the mask at the final point so the caller sees a consistent
    // (x, h_masked, free) triple.
    let g = client.add(&bmv(client, h, &x)?, q)?;
    let at_lo = client.le(&x, lower)?;
    let at_hi = client.ge(&x, upper)?;
    let push_out = client.gt(&g, &zeros)?;
    let push_in = client.lt(&g, &zeros)?;
    let mut active = client.maximum(
        &client.mul(&at_lo, &push_out)?,
        &client.mul(&at_hi, &push_in)?,
    )?;
    if let Some(z) = held_zero {
        active = client.maximum(&active, z)?;
    }
    let free = client.sub(&ones, &active)?;
    let ff = bger(client, &free, &free)?;
    let active_diag = client.mul(
        &eye_b,
        &active.unsqueeze(2)?.broadcast_to(&[n_batch, n, n])?,
    )?;
    let h_masked = client.add(
        &client.add(&client.mul(h, &ff)?, &active_diag)?,
        &client.mul_scalar(&eye_b, DIAG_REG)?,
    )?;

    Ok(PnqpSolution {
        x,
        h_masked,
        free_mask: free,
        iterations: max_iter,
    })
}
