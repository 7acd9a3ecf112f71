//! Error types for the MPC solver.

use std::fmt;

/// Result type for MPC operations.
pub type MpcResult<T> = Result<T, MpcError>;

/// Errors that can occur while building or solving an MPC problem.
#[derive(Debug, Clone)]
pub enum MpcError {
    /// Inconsistent or unresolvable problem configuration. Always fatal and
    /// raised before any solve work starts.
    Config { message: String },

    /// A combination of options the solver does not support.
    Unimplemented { feature: String },

    /// Singular reduced Hessian in the box-QP solve, or NaN/Inf propagation
    /// inside a recursion. There is no safe recovery within a single solve.
    IllConditioned { context: String },

    /// One or more batch elements did not reach a fixed point within the
    /// outer iteration budget.
    DidNotConverge {
        iterations: usize,
        max_du_norm: f64,
        tolerance: f64,
    },

    /// The analytic Jacobian disagrees with the autodiff Jacobian beyond
    /// tolerance (only raised by `GradMethod::AnalyticCheck`).
    AnalyticCheckFailed { max_err: f64, tolerance: f64 },

    /// Error from an underlying numr operation.
    NumrError(String),
}

impl fmt::Display for MpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message } => {
                write!(f, "Invalid MPC configuration: {}", message)
            }
            Self::Unimplemented { feature } => {
                write!(f, "Unimplemented: {}", feature)
            }
            Self::IllConditioned { context } => {
                write!(f, "Numerically ill-conditioned problem in {}", context)
            }
            Self::DidNotConverge {
                iterations,
                max_du_norm,
                tolerance,
            } => {
                write!(
                    f,
                    "MPC did not converge after {} iterations: max ||du|| = {:.3e} (tolerance: {:.3e})",
                    iterations, max_du_norm, tolerance
                )
            }
            Self::AnalyticCheckFailed { max_err, tolerance } => {
                write!(
                    f,
                    "Analytic Jacobian check failed: max deviation {:.3e} from autodiff (tolerance: {:.3e})",
                    max_err, tolerance
                )
            }
            Self::NumrError(msg) => {
                write!(f, "numr error: {}", msg)
            }
        }
    }
}

impl std::error::Error for MpcError {}

impl From<numr::error::Error> for MpcError {
    fn from(err: numr::error::Error) -> Self {
        Self::NumrError(err.to_string())
    }
}
