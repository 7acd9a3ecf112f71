//! The dynamics collaborator interface.

use numr::autograd::Var;
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

use crate::mpc::error::{MpcError, MpcResult};

/// A discrete-time dynamics function `x_{t+1} = f(x_t, u_t)`, batched over
/// the leading dimension.
///
/// `step` is the only required capability. The two optional capabilities
/// unlock linearization strategies: `jacobian` for
/// [`GradMethod::Analytic`](crate::mpc::GradMethod) and `step_var` (the same
/// map expressed in `numr::autograd` operations) for
/// [`GradMethod::AutoDiff`](crate::mpc::GradMethod). A strategy whose
/// capability is missing fails with a configuration error.
pub trait Dynamics<R: Runtime, C: RuntimeClient<R>> {
    /// Advance the state one step: `[n_batch, n_state] x [n_batch, n_ctrl]`
    /// to `[n_batch, n_state]`.
    fn step(&self, client: &C, x: &Tensor<R>, u: &Tensor<R>) -> MpcResult<Tensor<R>>;

    /// Jacobians of `step` with respect to the state and control:
    /// `([n_batch, n_state, n_state], [n_batch, n_state, n_ctrl])`.
    fn jacobian(
        &self,
        client: &C,
        x: &Tensor<R>,
        u: &Tensor<R>,
    ) -> MpcResult<Option<(Tensor<R>, Tensor<R>)>> {
        let _ = (client, x, u);
        Ok(None)
    }

    /// `step` expressed on autograd variables, for reverse-mode
    /// linearization.
    fn step_var(&self, client: &C, x: &Var<R>, u: &Var<R>) -> MpcResult<Option<Var<R>>> {
        let _ = (client, x, u);
        Ok(None)
    }
}

/// Which dynamics model a solve runs under: a nonlinear function that gets
/// re-linearized every outer iteration, or fixed affine coefficients
/// `F: [T-1, n_batch, n_state, n_tau]`, `f: [T-1, n_batch, n_state]`.
#[derive(Debug)]
pub enum DynamicsModel<'a, R: Runtime, D> {
    Nonlinear(&'a D),
    Affine {
        f_mat: &'a Tensor<R>,
        f_vec: Option<&'a Tensor<R>>,
    },
}

// Manual impls: the enum only holds references, so it is copyable for any D.
impl<R: Runtime, D> Clone for DynamicsModel<'_, R, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R: Runtime, D> Copy for DynamicsModel<'_, R, D> {}

/// Placeholder dynamics type for purely affine problems.
pub struct NoDynamics;

impl<R: Runtime, C: RuntimeClient<R>> Dynamics<R, C> for NoDynamics {
    fn step(&self, _client: &C, _x: &Tensor<R>, _u: &Tensor<R>) -> MpcResult<Tensor<R>> {
        Err(MpcError::Config {
            message: "an affine dynamics model has no step function".to_string(),
        })
    }
}

/// An affine model over the placeholder dynamics type, for call sites that
/// pass precomputed `(F, f)` coefficients.
pub type AffineModel<'a, R> = DynamicsModel<'a, R, NoDynamics>;

/// Wraps a dynamics function for the slew-rate augmented state
/// `[u_{t-1}, x_t]`: the step maps it to `[u_t, f(x_t, u_t)]`, passing the
/// applied control through so the next stage can penalize its change.
pub struct CtrlPassthroughDynamics<'a, D> {
    inner: &'a D,
    n_ctrl: usize,
}

impl<'a, D> CtrlPassthroughDynamics<'a, D> {
    pub fn new(inner: &'a D, n_ctrl: usize) -> Self {
        Self { inner, n_ctrl }
    }
}

impl<R, C, D> Dynamics<R, C> for CtrlPassthroughDynamics<'_, D>
where
    R: Runtime,
    C: TensorOps<R> + RuntimeClient<R>,
    D: Dynamics<R, C>,
{
    fn step(&self, client: &C, aug_x: &Tensor<R>, u: &Tensor<R>) -> MpcResult<Tensor<R>> {
        let n_aug = aug_x.shape()[1];
        let x = aug_x
            .narrow(1, self.n_ctrl, n_aug - self.n_ctrl)?
            .contiguous();
        let next = self.inner.step(client, &x, u)?;
        Ok(client.cat(&[u, &next], 1)?)
    }

    fn jacobian(
        &self,
        client: &C,
        aug_x: &Tensor<R>,
        u: &Tensor<R>,
    ) -> MpcResult<Option<(Tensor<R>, Tensor<R>)>> {
        let n_batch = aug_x.shape()[0];
        let n_aug = aug_x.shape()[1];
        let n_state = n_aug - self.n_ctrl;
        let x = aug_x.narrow(1, self.n_ctrl, n_state)?.contiguous();
        let Some((r_x, s_u)) = self.inner.jacobian(client, &x, u)? else {
            return Ok(None);
        };

        // d[u_t, x_{t+1}] / d[u_{t-1}, x_t] = [[0, 0], [0, R]]
        let zeros_top = client.fill(&[n_batch, self.n_ctrl, n_aug], 0.0, DType::F64)?;
        let zeros_left = client.fill(&[n_batch, n_state, self.n_ctrl], 0.0, DType::F64)?;
        let bottom = client.cat(&[&zeros_left, &r_x], 2)?;
        let r_aug = client.cat(&[&zeros_top, &bottom], 1)?;

        // d[u_t, x_{t+1}] / du_t = [I, S]
        let eye = client
            .eye(self.n_ctrl, None, DType::F64)?
            .unsqueeze(0)?
            .broadcast_to(&[n_batch, self.n_ctrl, self.n_ctrl])?
            .contiguous();
        let s_aug = client.cat(&[&eye, &s_u], 1)?;

        Ok(Some((r_aug, s_aug)))
    }
}
