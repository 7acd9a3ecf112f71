//! Batched tensor helpers shared by the MPC solver internals.
//!
//! The solver works on stacks of per-timestep, per-batch-element matrices and
//! vectors. numr's binary operations do not broadcast implicitly, so every
//! batched product here expands its operands with `broadcast_to` and reduces
//! with `sum`.

use numr::algorithm::linalg::LinearAlgebraAlgorithms;
use numr::dtype::DType;
use numr::ops::{BinaryOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::mpc::error::{MpcError, MpcResult};

/// Slice timestep `t` out of a time-leading tensor, dropping the time axis.
pub fn at_t<R: Runtime>(x: &Tensor<R>, t: usize) -> MpcResult<Tensor<R>> {
    let inner = &x.shape()[1..];
    Ok(x.narrow(0, t, 1)?.contiguous().reshape(inner)?)
}

/// Stack per-timestep tensors along a new leading time axis.
pub fn stack0<R, C>(client: &C, parts: &[Tensor<R>]) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let lifted: Vec<Tensor<R>> = parts
        .iter()
        .map(|p| p.unsqueeze(0))
        .collect::<Result<_, _>>()?;
    let refs: Vec<&Tensor<R>> = lifted.iter().collect();
    Ok(client.cat(&refs, 0)?)
}

/// Batched matrix-vector product: `[B, m, n] x [B, n] -> [B, m]`.
pub fn bmv<R, C>(client: &C, a: &Tensor<R>, v: &Tensor<R>) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let (b, m, n) = (a.shape()[0], a.shape()[1], a.shape()[2]);
    let v_wide = v.unsqueeze(1)?.broadcast_to(&[b, m, n])?;
    let prod = client.mul(a, &v_wide)?;
    Ok(client.sum(&prod, &[2], false)?)
}

/// Batched outer product: `[B, m] x [B, n] -> [B, m, n]`.
pub fn bger<R, C>(client: &C, a: &Tensor<R>, b: &Tensor<R>) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let (nb, m) = (a.shape()[0], a.shape()[1]);
    let n = b.shape()[1];
    let a_wide = a.unsqueeze(2)?.broadcast_to(&[nb, m, n])?;
    let b_wide = b.unsqueeze(1)?.broadcast_to(&[nb, m, n])?;
    Ok(client.mul(&a_wide, &b_wide)?)
}

/// Batched matrix-matrix product: `[B, m, k] x [B, k, n] -> [B, m, n]`.
pub fn bmm<R, C>(client: &C, a: &Tensor<R>, b: &Tensor<R>) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let (nb, m, k) = (a.shape()[0], a.shape()[1], a.shape()[2]);
    let n = b.shape()[2];
    let a_wide = a.unsqueeze(3)?.broadcast_to(&[nb, m, k, n])?;
    let b_wide = b.unsqueeze(1)?.broadcast_to(&[nb, m, k, n])?;
    let prod = client.mul(&a_wide, &b_wide)?;
    Ok(client.sum(&prod, &[2], false)?)
}

/// Batched transpose of a stack of matrices: `[B, m, n] -> [B, n, m]`.
pub fn btranspose<R: Runtime>(a: &Tensor<R>) -> MpcResult<Tensor<R>> {
    Ok(a.transpose(1, 2)?.contiguous())
}

/// Batched linear solve `A x = b` for `A: [B, n, n]`, `b: [B, n]`.
///
/// numr's dense solver is unbatched, so this loops over the batch. A singular
/// system surfaces as [`MpcError::IllConditioned`] tagged with `context`.
pub fn bsolve<R, C>(client: &C, a: &Tensor<R>, b: &Tensor<R>, context: &str) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + LinearAlgebraAlgorithms<R> + RuntimeClient<R>,
{
    let (nb, n) = (a.shape()[0], a.shape()[1]);
    let mut rows: Vec<Tensor<R>> = Vec::with_capacity(nb);
    for i in 0..nb {
        let a_i = a.narrow(0, i, 1)?.contiguous().reshape(&[n, n])?;
        let b_i = b.narrow(0, i, 1)?.contiguous().reshape(&[n, 1])?;
        let sol = LinearAlgebraAlgorithms::solve(client, &a_i, &b_i).map_err(|e| {
            MpcError::IllConditioned {
                context: format!("{} (batch element {}): {}", context, i, e),
            }
        })?;
        rows.push(sol.reshape(&[1, n])?);
    }
    let refs: Vec<&Tensor<R>> = rows.iter().collect();
    Ok(client.cat(&refs, 0)?)
}

/// Batched linear solve with a matrix right-hand side: `A X = B` for
/// `A: [B, n, n]`, `B: [B, n, k]`.
pub fn bsolve_mat<R, C>(
    client: &C,
    a: &Tensor<R>,
    b: &Tensor<R>,
    context: &str,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + LinearAlgebraAlgorithms<R> + RuntimeClient<R>,
{
    let (nb, n) = (a.shape()[0], a.shape()[1]);
    let k = b.shape()[2];
    let mut parts: Vec<Tensor<R>> = Vec::with_capacity(nb);
    for i in 0..nb {
        let a_i = a.narrow(0, i, 1)?.contiguous().reshape(&[n, n])?;
        let b_i = b.narrow(0, i, 1)?.contiguous().reshape(&[n, k])?;
        let sol = LinearAlgebraAlgorithms::solve(client, &a_i, &b_i).map_err(|e| {
            MpcError::IllConditioned {
                context: format!("{} (batch element {}): {}", context, i, e),
            }
        })?;
        parts.push(sol.reshape(&[1, n, k])?);
    }
    let refs: Vec<&Tensor<R>> = parts.iter().collect();
    Ok(client.cat(&refs, 0)?)
}

/// Elementwise clamp of `x` into `[lower, upper]`, all shapes identical.
pub fn clamp_tensor<R, C>(
    client: &C,
    x: &Tensor<R>,
    lower: &Tensor<R>,
    upper: &Tensor<R>,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: BinaryOps<R> + RuntimeClient<R>,
{
    let hi = client.minimum(x, upper)?;
    Ok(client.maximum(&hi, lower)?)
}

/// Per-batch-element Euclidean norm over every trailing dimension of a
/// time-leading tensor `[T, B, ...] -> Vec of length B`.
pub fn per_batch_norm<R, C>(client: &C, x: &Tensor<R>) -> MpcResult<Vec<f64>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let n_batch = x.shape()[1];
    let flat_len: usize = x.shape()[2..].iter().product();
    let t = x.shape()[0];
    let sq = client.mul(x, x)?;
    let flat = sq.reshape(&[t, n_batch, flat_len])?;
    let summed = client.sum(&flat, &[0, 2], false)?;
    let vals: Vec<f64> = summed.to_vec();
    Ok(vals.into_iter().map(f64::sqrt).collect())
}

/// Quadratic objective per batch element for one stage:
/// `0.5 tau' C tau + c' tau` with `C: [B, n, n]`, `c, tau: [B, n]`, giving
/// `[B]`.
pub fn batch_quad_obj<R, C>(
    client: &C,
    c_mat: &Tensor<R>,
    c_vec: &Tensor<R>,
    tau: &Tensor<R>,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let c_tau = bmv(client, c_mat, tau)?;
    let quad = client.sum(&client.mul(tau, &c_tau)?, &[1], false)?;
    let lin = client.sum(&client.mul(c_vec, tau)?, &[1], false)?;
    let half = client.fill(&[quad.shape()[0]], 0.5, DType::F64)?;
    Ok(client.add(&client.mul(&quad, &half)?, &lin)?)
}

/// Total quadratic trajectory cost per batch element:
/// `sum_t 0.5 tau_t' C_t tau_t + c_t' tau_t`, giving `[B]`.
pub fn trajectory_cost<R, C>(
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
    let n_batch = x.shape()[1];
    let mut total = client.fill(&[n_batch], 0.0, DType::F64)?;
    for t in 0..horizon {
        let tau = client.cat(&[&at_t(x, t)?, &at_t(u, t)?], 1)?;
        let stage = batch_quad_obj(client, &at_t(c_mat, t)?, &at_t(c_vec, t)?, &tau)?;
        total = client.add(&total, &stage)?;
    }
    Ok(total)
}

/// Roll a control sequence through affine dynamics from `x_init`, returning
/// the state trajectory `[T, B, n_state]`.
pub fn rollout_affine<R, C>(
    client: &C,
    f_mat: &Tensor<R>,
    f_vec: Option<&Tensor<R>>,
    x_init: &Tensor<R>,
    u: &Tensor<R>,
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    let horizon = u.shape()[0];
    let n_state = x_init.shape()[1];
    let mut states: Vec<Tensor<R>> = Vec::with_capacity(horizon);
    states.push(x_init.clone());
    for t in 0..horizon - 1 {
        let tau = client.cat(&[&states[t], &at_t(u, t)?], 1)?;
        let mut next = bmv(client, &at_t(f_mat, t)?, &tau)?;
        if let Some(fv) = f_vec {
            next = client.add(&next, &at_t(fv, t)?)?;
        }
        debug_assert_eq!(next.shape()[1], n_state);
        states.push(next);
    }
    stack0(client, &states)
}

/// Rebuild a time-leading tensor with the given batch columns replaced by the
/// matching columns of `src`. `take_src[i]` selects element `i`'s source.
///
/// Column surgery instead of an arithmetic blend: a rejected candidate column
/// may hold NaN, and `0 * NaN` would leak it into the result.
pub fn select_batch_columns<R, C>(
    client: &C,
    dst: &Tensor<R>,
    src: &Tensor<R>,
    take_src: &[bool],
) -> MpcResult<Tensor<R>>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
{
    if take_src.iter().all(|&t| !t) {
        return Ok(dst.clone());
    }
    if take_src.iter().all(|&t| t) {
        return Ok(src.clone());
    }
    let n_batch = dst.shape()[1];
    debug_assert_eq!(take_src.len(), n_batch);
    let mut cols: Vec<Tensor<R>> = Vec::with_capacity(n_batch);
    for (i, &take) in take_src.iter().enumerate() {
        let col = if take {
            src.narrow(1, i, 1)?
        } else {
            dst.narrow(1, i, 1)?
        };
        cols.push(col.contiguous());
    }
    let refs: Vec<&Tensor<R>> = cols.iter().collect();
    Ok(client.cat(&refs, 1)?)
}

/// True when every entry of `x` is finite.
pub fn all_finite<R: Runtime>(x: &Tensor<R>) -> bool {
    x.to_vec().iter().all(|v: &f64| v.is_finite())
}

/// Guard against NaN/Inf propagation inside a recursion.
pub fn ensure_finite<R: Runtime>(x: &Tensor<R>, context: &str) -> MpcResult<()> {
    if all_finite(x) {
        Ok(())
    } else {
        Err(MpcError::IllConditioned {
            context: format!("{}: non-finite values", context),
        })
    }
}
