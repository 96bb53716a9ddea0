use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Process '{process}' has no steps")]
    EmptyProcess { process: String },

    #[error("Step or process is missing a name (id: {id:?})")]
    MissingName { id: Option<String> },

    #[error("Step '{name}' is missing a state id")]
    MissingStepId { name: String },

    #[error("Invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Duplicate step id '{id}' in process '{process}'")]
    DuplicateStepId { process: String, id: String },

    #[error("Process '{id}' nests itself")]
    NestingCycle { id: String },

    #[error("Edge from '{source_step}' targets unknown step '{target}'")]
    UnknownEdgeTarget { source_step: String, target: String },

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Actor not initialized: {0}")]
    NotInitialized(String),

    #[error("Actor not found: {0}")]
    ActorNotFound(String),

    #[error("Actor {actor} does not support call '{call}'")]
    UnsupportedCall { actor: String, call: String },

    #[error("Function not found: step={step}, function={function}")]
    FunctionNotFound { step: String, function: String },

    #[error("Invalid argument '{name}': {message}")]
    InvalidArgument { name: String, message: String },

    #[error("Function invocation error: step={step}, function={function}, {message}")]
    FunctionInvocation {
        step: String,
        function: String,
        message: String,
    },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("Process {0} is already running")]
    AlreadyRunning(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Process task failed: {0}")]
    Task(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ProcessError {
    /// Whether the error was raised while validating or binding a graph.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            ProcessError::Initialization(_)
                | ProcessError::EmptyProcess { .. }
                | ProcessError::MissingName { .. }
                | ProcessError::MissingStepId { .. }
                | ProcessError::InvalidId { .. }
                | ProcessError::DuplicateStepId { .. }
                | ProcessError::NestingCycle { .. }
                | ProcessError::UnknownEdgeTarget { .. }
                | ProcessError::UnknownStepType(_)
                | ProcessError::NotInitialized(_)
        )
    }
}

pub type ProcessResult<T> = Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formats() {
        let err = ProcessError::EmptyProcess {
            process: "kitchen".into(),
        };
        assert_eq!(err.to_string(), "Process 'kitchen' has no steps");

        let err = ProcessError::FunctionNotFound {
            step: "cook".into(),
            function: "boil".into(),
        };
        assert!(err.to_string().contains("boil"));

        let err = ProcessError::DuplicateStepId {
            process: "kitchen".into(),
            id: "cut".into(),
        };
        assert!(err.to_string().contains("'cut'"));
    }

    #[test]
    fn initialization_classification() {
        assert!(ProcessError::MissingStepId { name: "cut".into() }.is_initialization());
        assert!(ProcessError::NestingCycle { id: "p".into() }.is_initialization());
        assert!(!ProcessError::Routing("no target".into()).is_initialization());
        assert!(!ProcessError::State("poisoned".into()).is_initialization());
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ProcessError>();
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<String>("invalid").unwrap_err();
        let err: ProcessError = json_err.into();
        assert!(matches!(err, ProcessError::Serialization(_)));
    }

    #[test]
    fn anyhow_error_converts() {
        let err: ProcessError = anyhow::anyhow!("oven on fire").into();
        assert_eq!(err.to_string(), "oven on fire");
    }
}
