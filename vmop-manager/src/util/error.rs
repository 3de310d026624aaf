#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("YAML error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Failed to build child resource: {0}")]
    Template(String),

    #[error("Timed out waiting for runner confirmation")]
    Timeout,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Exceeded the {0} conflict retries for {1}")]
    ConflictRetriesExhausted(u32, String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
