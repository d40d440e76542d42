use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Failed to connect SSH session or execute SSH command: {0}")]
    SshError(#[from] openssh::Error),
    #[error("Failed to execute local command: {0}")]
    LocalCommandError(#[from] std::io::Error),
    #[error("Failed to parse YAML file: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("Invalid target definition: {0}")]
    InvalidTarget(String),
    #[error("GPU probe failed: {0}")]
    ProbeFailed(String),
    #[error("All targets exhausted their retry budget with {pending} task(s) still pending")]
    TargetsExhausted { pending: usize },
    #[error("Sweep interrupted before the task queue was drained")]
    Interrupted,
}
