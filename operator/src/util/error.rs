#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Out of range: {source}")]
    OutOfRange {
        #[from]
        source: chrono::OutOfRangeError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Invalid retention: {source}")]
    Retention {
        #[from]
        source: vmop_types::retention::RetentionError,
    },

    #[error("Invalid quantity: {source}")]
    Quantity {
        #[from]
        source: vmop_types::quantity::QuantityError,
    },
}

impl Error {
    /// Whether the underlying API error is worth retrying with backoff.
    /// Validation and admission failures only resolve on a spec change.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409 || ae.code >= 500,
            Error::Kube { .. } => true,
            _ => false,
        }
    }
}
