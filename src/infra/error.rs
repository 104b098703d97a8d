use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("failed to connect to the {backend} search cache database: {source}")]
    Connect {
        backend: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("search cache migrations failed: {0}")]
    Migration(#[source] sqlx::Error),
    #[error("search cache database health check failed: {0}")]
    HealthCheck(#[source] sqlx::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
