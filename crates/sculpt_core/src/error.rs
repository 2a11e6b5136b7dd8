//! Error types for the optimization core.

use thiserror::Error;

use crate::optimization::NonConvergenceReason;

/// Result type alias used throughout the core.
pub type Result<T> = std::result::Result<T, SculptError>;

/// Reason code reported by a linear solve that did not converge.
///
/// The numeric codes follow the usual Krylov-backend convention of negative
/// values for divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergedReason {
    Iterations,
    Breakdown,
    Indefinite,
    NanOrInf,
    Singular,
}

impl DivergedReason {
    pub fn code(self) -> i32 {
        match self {
            DivergedReason::Iterations => -3,
            DivergedReason::Breakdown => -5,
            DivergedReason::Indefinite => -8,
            DivergedReason::NanOrInf => -9,
            DivergedReason::Singular => -11,
        }
    }
}

impl std::fmt::Display for DivergedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DivergedReason::Iterations => "DIVERGED_ITS",
            DivergedReason::Breakdown => "DIVERGED_BREAKDOWN",
            DivergedReason::Indefinite => "DIVERGED_INDEFINITE_PC",
            DivergedReason::NanOrInf => "DIVERGED_NANORINF",
            DivergedReason::Singular => "DIVERGED_SINGULAR",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Errors raised by the optimization core.
#[derive(Debug, Error)]
pub enum SculptError {
    /// An argument had the wrong shape or an unusable value.
    #[error("invalid input for {context}: {details}")]
    InvalidInput { context: String, details: String },

    /// Two configuration options contradict each other.
    #[error("incompatible configuration: {0}")]
    IncompatibleConfiguration(String),

    /// The optimization stopped without satisfying the convergence test.
    #[error("optimization did not converge: {reason}")]
    NotConverged { reason: NonConvergenceReason },

    /// A linear solve did not reach its tolerance.
    #[error("linear solver `{solver}` did not converge after {iterations} iterations: {reason}")]
    SolveDiverged {
        solver: String,
        reason: DivergedReason,
        iterations: usize,
    },

    /// Projection onto the working set failed even at the smallest stepsize.
    #[error("gradient projection failed: {0}")]
    ProjectionFailed(String),

    /// An external program exited unsuccessfully.
    #[error("external command `{command}` failed: {status}")]
    ExternalTool { command: String, status: String },

    /// A mesh file could not be parsed.
    #[error("malformed mesh file {path}: {details}")]
    MeshFormat { path: String, details: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Failure reported by a problem callback (state, adjoint or gradient solve).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl SculptError {
    #[must_use]
    pub fn invalid_input(context: impl Into<String>, details: impl Into<String>) -> Self {
        Self::InvalidInput {
            context: context.into(),
            details: details.into(),
        }
    }

    #[must_use]
    pub fn incompatible(details: impl Into<String>) -> Self {
        Self::IncompatibleConfiguration(details.into())
    }

    #[must_use]
    pub fn external_tool(command: impl Into<String>, status: impl std::fmt::Display) -> Self {
        Self::ExternalTool {
            command: command.into(),
            status: status.to_string(),
        }
    }

    #[must_use]
    pub fn mesh_format(path: impl AsRef<std::path::Path>, details: impl Into<String>) -> Self {
        Self::MeshFormat {
            path: path.as_ref().display().to_string(),
            details: details.into(),
        }
    }
}
