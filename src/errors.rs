use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    // Preconditions
    #[error("Required binary {0} not found on PATH")]
    BinaryMissing(String),
    #[error("Required file {0:?} does not exist")]
    FileMissing(PathBuf),

    // External processes
    #[error("Failed to launch {program}: {source}")]
    LaunchFailure {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Operation cancelled")]
    Cancelled,

    // Kubernetes
    #[error("Kubernetes error {0}")]
    Kube(#[from] kube::Error),
    #[error("Failed to load kubeconfig {0:?}: {1}")]
    Kubeconfig(PathBuf, String),

    // Configuration
    #[error("Failed to read configuration {0:?}: {1}")]
    ConfigRead(PathBuf, std::io::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Error parsing value: {0}")]
    ParseHumanize(#[from] humanize_rs::ParseError),
    #[error("Unknown command {0}, try --help")]
    UnknownCommand(String),

    // Misc libs
    #[error("IO error {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error {0}")]
    Yaml(#[from] serde_yaml::Error),

    // Tracing
    #[error("Failed to set up trace exporter: {0}")]
    TraceExporter(#[from] opentelemetry::trace::TraceError),
    #[error("Failed to install tracing subscriber: {0}")]
    TracingSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

impl Error {
    /// Errors that abort a run before any external state has been touched
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            Error::BinaryMissing(_) | Error::FileMissing(_) | Error::InvalidConfig(_)
        )
    }
}
