//! Option, problem, and result types for the MPC solver.

use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Strategy used to linearize the nonlinear dynamics around the current
/// trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GradMethod {
    /// Use the dynamics' own Jacobian callback, evaluated once over all
    /// timesteps batched together. Fast and accurate; use this if possible.
    #[default]
    Analytic,
    /// Reverse-mode automatic differentiation, one state output dimension at
    /// a time. Slower by a factor of `n_state`.
    AutoDiff,
    /// Forward finite differences with a fixed step. Least accurate.
    FiniteDiff,
    /// Compute both the analytic and autodiff Jacobians and fail with a
    /// diagnostic if they disagree. A debugging aid, not for production.
    AnalyticCheck,
}

/// A control bound, either shared by every entry or given in full as a
/// `[T, n_batch, n_ctrl]` tensor.
#[derive(Debug, Clone)]
pub enum Bound<R: Runtime> {
    Scalar(f64),
    Full(Tensor<R>),
}

/// Quadratic cost coefficients over the horizon.
///
/// `c_mat` is `[T, n_batch, n_tau, n_tau]` (or `[T, n_tau, n_tau]`, expanded
/// over the batch at entry) and `c_vec` is `[T, n_batch, n_tau]` (or
/// `[T, n_tau]`), with `n_tau = n_state + n_ctrl`. Each `c_mat[t]` must be
/// symmetric with a solvable control block; a degenerate block surfaces as
/// [`MpcError::IllConditioned`](crate::mpc::MpcError) during the backward
/// recursion.
#[derive(Debug, Clone)]
pub struct QuadCost<R: Runtime> {
    pub c_mat: Tensor<R>,
    pub c_vec: Tensor<R>,
}

/// Options for the MPC solver.
///
/// Defaults mirror the reference box-DDP formulation: 10 outer LQR
/// iterations, convergence on the full control step norm at 1e-7, and a
/// backtracking line search with decay 0.2.
#[derive(Debug, Clone)]
pub struct MpcOptions<R: Runtime> {
    /// State dimension.
    pub n_state: usize,
    /// Control dimension.
    pub n_ctrl: usize,
    /// Horizon length T (number of cost stages; T-1 dynamics steps).
    pub horizon: usize,
    /// Maximum number of outer LQR iterations.
    pub lqr_iter: usize,
    /// Dynamics linearization strategy.
    pub grad_method: GradMethod,
    /// Lower control bound. Must be given together with `u_upper` or not at
    /// all.
    pub u_lower: Option<Bound<R>>,
    /// Upper control bound.
    pub u_upper: Option<Bound<R>>,
    /// Control dimensions held at exactly zero, as a `[T, n_batch, n_ctrl]`
    /// 0/1 mask. Masked dimensions are excluded from the box-QP.
    pub u_zero_mask: Option<Tensor<R>>,
    /// Warm-start control sequence `[T, n_batch, n_ctrl]`.
    pub u_init: Option<Tensor<R>>,
    /// Largest change allowed per control dimension in one LQR iteration.
    pub delta_u: Option<f64>,
    /// Convergence threshold on the norm of the full control step.
    pub eps: f64,
    /// Convergence tolerance of the box-QP micro-solver and of the companion
    /// gradient solve.
    pub back_eps: f64,
    /// Batch size, required when it cannot be inferred from the cost shape.
    pub n_batch: Option<usize>,
    /// Multiplicative line search decay factor.
    pub linesearch_decay: f64,
    /// Maximum number of line search backtracking attempts. Use 1 to disable
    /// the line search.
    pub max_linesearch_iter: usize,
    /// Fail with [`MpcError::DidNotConverge`](crate::mpc::MpcError) when any
    /// batch element does not reach a fixed point.
    pub exit_unconverged: bool,
    /// When not exiting, exclude unconverged batch elements from the gradient
    /// computation so they cannot poison converged ones.
    pub detach_unconverged: bool,
    /// Quadratic penalty weight on the change of consecutive controls.
    pub slew_rate_penalty: Option<f64>,
    /// Control applied before the first timestep, `[n_batch, n_ctrl]`. Only
    /// used with `slew_rate_penalty`; defaults to zero.
    pub prev_ctrl: Option<Tensor<R>>,
    /// Stop after this many consecutive iterations without a best-cost
    /// improvement.
    pub not_improved_lim: usize,
    /// Margin by which a new cost must undercut the best recorded cost to
    /// count as an improvement.
    pub best_cost_eps: f64,
}

impl<R: Runtime> MpcOptions<R> {
    /// Options for a problem of the given dimensions, everything else at its
    /// default.
    pub fn new(n_state: usize, n_ctrl: usize, horizon: usize) -> Self {
        Self {
            n_state,
            n_ctrl,
            horizon,
            lqr_iter: 10,
            grad_method: GradMethod::default(),
            u_lower: None,
            u_upper: None,
            u_zero_mask: None,
            u_init: None,
            delta_u: None,
            eps: 1e-7,
            back_eps: 1e-7,
            n_batch: None,
            linesearch_decay: 0.2,
            max_linesearch_iter: 10,
            exit_unconverged: true,
            detach_unconverged: true,
            slew_rate_penalty: None,
            prev_ctrl: None,
            not_improved_lim: 5,
            best_cost_eps: 1e-4,
        }
    }
}

/// Per-batch-element convergence outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The element reached a fixed point; its trajectory is differentiable.
    Converged,
    /// The element exhausted the iteration budget. Its trajectory is the best
    /// found and, with `detach_unconverged`, carries no gradient.
    Unconverged,
}

/// Solve diagnostics.
#[derive(Debug, Clone, Default)]
pub struct MpcDiagnostics {
    /// Outer LQR iterations performed.
    pub iterations: usize,
    /// Total projected-Newton iterations across every box-QP micro-solve.
    pub total_qp_iters: usize,
    /// Mean line search step size of the last accepted iterate.
    pub mean_alpha: f64,
    /// Per-element norm of the full control step of the last iteration.
    pub full_du_norm: Vec<f64>,
}

/// Everything `mpc_grad` needs to differentiate through the fixed point:
/// the problem data at convergence, the converged trajectory, the recorded
/// active-set mask, and which batch elements participate in gradients.
#[derive(Debug, Clone)]
pub(crate) struct BackwardContext<R: Runtime> {
    pub c_mat: Tensor<R>,
    pub c_vec: Tensor<R>,
    pub f_mat: Option<Tensor<R>>,
    pub f_vec: Option<Tensor<R>>,
    pub x: Tensor<R>,
    pub u: Tensor<R>,
    /// `[T, n_batch, n_ctrl]`, 1 where the control dimension was free at the
    /// optimum (not at a bound, not held at zero).
    pub free_mask: Option<Tensor<R>>,
    /// Per batch element, 1.0 when its gradients flow, 0.0 when detached.
    pub grad_mask: Vec<f64>,
    pub n_state: usize,
    pub n_ctrl: usize,
    pub horizon: usize,
    pub n_batch: usize,
    pub back_eps: f64,
    /// Set when the problem was solved in slew-rate augmented form; gradients
    /// are sliced back to the caller's coordinates. Holds the raw state
    /// dimension.
    pub slew_raw_n_state: Option<usize>,
}

/// Result of an MPC solve.
///
/// `x` is `[T, n_batch, n_state]`, `u` is `[T, n_batch, n_ctrl]` and `costs`
/// holds the realized objective per batch element. The solution retains the
/// linearized problem data at the fixed point so that
/// [`mpc_grad`](crate::mpc::MpcAlgorithms::mpc_grad) can run the companion
/// LQR solve without re-solving the problem.
#[derive(Debug, Clone)]
pub struct MpcSolution<R: Runtime> {
    pub x: Tensor<R>,
    pub u: Tensor<R>,
    pub costs: Tensor<R>,
    pub outcomes: Vec<BatchOutcome>,
    pub diagnostics: MpcDiagnostics,
    pub(crate) backward: BackwardContext<R>,
}

/// Gradients of a scalar loss with respect to the MPC problem data, produced
/// by one companion LQR solve.
#[derive(Debug, Clone)]
pub struct MpcGradients<R: Runtime> {
    /// Gradient with respect to the quadratic cost matrices,
    /// `[T, n_batch, n_tau, n_tau]`.
    pub dc_mat: Tensor<R>,
    /// Gradient with respect to the linear cost terms, `[T, n_batch, n_tau]`.
    pub dc_vec: Tensor<R>,
    /// Gradient with respect to the dynamics Jacobians,
    /// `[T-1, n_batch, n_state, n_tau]`. `None` for a single-stage problem.
    pub df_mat: Option<Tensor<R>>,
    /// Gradient with respect to the dynamics residuals,
    /// `[T-1, n_batch, n_state]`. `None` when the problem carried none.
    pub df_vec: Option<Tensor<R>>,
    /// Gradient with respect to the initial state, `[n_batch, n_state]`.
    pub dx_init: Tensor<R>,
}
