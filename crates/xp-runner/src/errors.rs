use thiserror::Error;

pub type Result<T> = std::result::Result<T, LaunchError>;

/// Every failure the pipeline can surface.
///
/// Configuration, generation and validation errors abort before any remote side
/// effect. Resource and remote-execution errors are scoped to one experiment: a
/// fan-out keeps dispatching its siblings.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("generation error (experiment {index}): {message}")]
    Generation { index: usize, message: String },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unsupported resource request: {key}={value}")]
    UnsupportedResource { key: String, value: String },
    #[error("remote command failed on {host} (status {status}): {command}\n{output}")]
    RemoteExecution {
        host: String,
        command: String,
        status: String,
        output: String,
    },
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LaunchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        LaunchError::Configuration(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        LaunchError::Validation(message.into())
    }

    pub fn generation(index: usize, message: impl Into<String>) -> Self {
        LaunchError::Generation {
            index,
            message: message.into(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::Configuration(_) => "configuration_error",
            LaunchError::Generation { .. } => "generation_error",
            LaunchError::Validation(_) => "validation_error",
            LaunchError::UnsupportedResource { .. } => "unsupported_resource",
            LaunchError::RemoteExecution { .. } => "remote_execution_error",
            LaunchError::Precondition(_) => "precondition_failed",
            LaunchError::Io(_) => "io_error",
            LaunchError::Yaml(_) | LaunchError::Json(_) => "serialization_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_item() {
        let err = LaunchError::UnsupportedResource {
            key: "tpu".to_string(),
            value: "1".to_string(),
        };
        assert_eq!(err.to_string(), "unsupported resource request: tpu=1");
        assert_eq!(err.code(), "unsupported_resource");

        let err = LaunchError::generation(3, "grid value for 'lr' is not a list");
        assert!(err.to_string().contains("experiment 3"));
    }

    #[test]
    fn remote_error_carries_raw_output() {
        let err = LaunchError::RemoteExecution {
            host: "user@cluster".to_string(),
            command: "mkdir -p /scratch/a".to_string(),
            status: "1".to_string(),
            output: "mkdir: permission denied".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("user@cluster"));
        assert!(msg.contains("permission denied"));
    }
}
