use std::{
    error::Error,
    fmt::{self, Display},
};
use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a monoops-related operation.
pub type MonoopsResult<T> = Result<T, MonoopsError>;

/// An error that occurred during an orchestration operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum MonoopsError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),

    /// An error that occurred while (de)serializing JSON.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred while (de)serializing YAML.
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// The project is not known to the registry.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// The backup does not exist.
    #[error("backup not found: {0}")]
    BackupNotFound(String),

    /// The deployment does not exist.
    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    /// The environment does not exist for the project.
    #[error("environment '{environment}' not found for project {project_id}")]
    EnvironmentNotFound {
        /// The project the environment was looked up for.
        project_id: String,

        /// The name of the missing environment.
        environment: String,
    },

    /// The project is already running or starting.
    #[error("project already running: {0}")]
    AlreadyRunning(String),

    /// No port could be allocated.
    #[error("port unavailable: {0}")]
    PortUnavailable(String),

    /// The concurrency limit for an operation kind has been reached.
    #[error("too many concurrent {operation} operations (limit {limit})")]
    TooManyConcurrentOperations {
        /// The kind of operation that was rejected.
        operation: String,

        /// The configured limit.
        limit: usize,
    },

    /// Input failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCronExpression {
        /// The rejected expression.
        expression: String,

        /// Why it was rejected.
        reason: String,
    },

    /// The project process could not be started.
    #[error("startup failed for {project_id}: {reason}")]
    StartupFailed {
        /// The project that failed to start.
        project_id: String,

        /// Why it failed.
        reason: String,
    },

    /// An external command exited non-zero.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// An external command or check did not finish in time.
    #[error("timed out after {seconds}s: {operation}")]
    Timeout {
        /// What was being waited on.
        operation: String,

        /// The timeout that elapsed.
        seconds: u64,
    },

    /// A health check or checksum did not match.
    #[error("verification failed: {0}")]
    VerificationFailed(String),

    /// No resource-limit enforcement backend is available.
    #[error("no enforcement backend available for {0}")]
    EnforcementUnavailable(String),

    /// Rollback was requested but no earlier successful deployment exists.
    #[error("no prior successful deployment for project {0}")]
    NoPriorDeployment(String),
}

/// The closed category an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Project, backup, deployment or environment absent.
    NotFound,

    /// Already running, port unavailable, too many concurrent operations.
    Conflict,

    /// Malformed input.
    ValidationFailed,

    /// A command exited non-zero or timed out.
    ExecutionFailed,

    /// A health check or checksum mismatch.
    VerificationFailed,

    /// No resource-limit backend present.
    EnforcementUnavailable,

    /// Anything environmental (I/O, serialization, transport).
    Internal,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MonoopsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> MonoopsError {
        MonoopsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the taxonomy category of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MonoopsError::ProjectNotFound(_)
            | MonoopsError::BackupNotFound(_)
            | MonoopsError::DeploymentNotFound(_)
            | MonoopsError::EnvironmentNotFound { .. }
            | MonoopsError::NoPriorDeployment(_) => ErrorKind::NotFound,
            MonoopsError::AlreadyRunning(_)
            | MonoopsError::PortUnavailable(_)
            | MonoopsError::TooManyConcurrentOperations { .. } => ErrorKind::Conflict,
            MonoopsError::Validation(_) | MonoopsError::InvalidCronExpression { .. } => {
                ErrorKind::ValidationFailed
            }
            MonoopsError::StartupFailed { .. }
            | MonoopsError::ExecutionFailed(_)
            | MonoopsError::Timeout { .. } => ErrorKind::ExecutionFailed,
            MonoopsError::VerificationFailed(_) => ErrorKind::VerificationFailed,
            MonoopsError::EnforcementUnavailable(_) => ErrorKind::EnforcementUnavailable,
            MonoopsError::Io(_)
            | MonoopsError::Custom(_)
            | MonoopsError::Json(_)
            | MonoopsError::Yaml(_)
            | MonoopsError::HttpRequest(_)
            | MonoopsError::JoinError(_) => ErrorKind::Internal,
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `MonoopsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> MonoopsResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_maps_taxonomy() {
        assert_eq!(
            MonoopsError::ProjectNotFound("a".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            MonoopsError::TooManyConcurrentOperations {
                operation: "backup".into(),
                limit: 3
            }
            .kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            MonoopsError::Timeout {
                operation: "build".into(),
                seconds: 5
            }
            .kind(),
            ErrorKind::ExecutionFailed
        );
        assert_eq!(
            MonoopsError::custom(anyhow::anyhow!("boom")).kind(),
            ErrorKind::Internal
        );
    }
}
