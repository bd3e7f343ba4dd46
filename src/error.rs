use std::fmt;

/// Optimizer operations that are only defined for some variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerOperation {
    Build,
    Checkpoint,
}

impl fmt::Display for OptimizerOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Checkpoint => write!(f, "checkpoint"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExperimentError {
    NonFiniteOutput { index: usize, value: f64 },
    EmptyOutput,
    UnsupportedOptimizer {
        kind: String,
        operation: OptimizerOperation,
    },
    CodeSizeShrank { previous: usize, current: usize },
    WorkerFailed { index: usize },
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    CheckpointVersion { found: u32, expected: u32 },
    InvalidConfig(String),
}

impl fmt::Display for ExperimentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonFiniteOutput { index, value } => write!(
                f,
                "non-finite network output {value} at index {index}: network state is corrupted"
            ),
            Self::EmptyOutput => write!(f, "network produced an empty output vector"),
            Self::UnsupportedOptimizer { kind, operation } => {
                write!(f, "optimizer '{kind}' does not support {operation}")
            }
            Self::CodeSizeShrank { previous, current } => write!(
                f,
                "compressor code size shrank from {previous} to {current}"
            ),
            Self::WorkerFailed { index } => {
                write!(f, "evaluation of individual {index} failed")
            }
            Self::DimensionMismatch {
                what,
                expected,
                actual,
            } => write!(f, "{what} mismatch: expected {expected}, got {actual}"),
            Self::CheckpointVersion { found, expected } => write!(
                f,
                "unsupported checkpoint version {found} (expected {expected})"
            ),
            Self::InvalidConfig(reason) => write!(f, "invalid config: {reason}"),
        }
    }
}

impl std::error::Error for ExperimentError {}

/// Returns the innermost typed experiment error carried by an `anyhow` chain.
///
/// Errors raised as values show up in `chain()`; errors attached with
/// `.context(ExperimentError::..)` are only reachable through `downcast_ref`,
/// which yields the outermost one.
pub fn find_experiment_error(err: &anyhow::Error) -> Option<&ExperimentError> {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<ExperimentError>())
        .last()
        .or_else(|| err.downcast_ref::<ExperimentError>())
}
