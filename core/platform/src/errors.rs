use std::net::SocketAddr;
use thiserror::Error;

/// Failures from the process-wide configuration and observability layer.
/// These all surface during startup; once the stack is installed the
/// recording helpers are infallible.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("tracing subscriber installation failed: {0}")]
    Subscriber(String),

    #[error("metrics exporter on {addr} unavailable: {reason}")]
    MetricsExporter { addr: SocketAddr, reason: String },
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_error_names_the_address() {
        let err = PlatformError::MetricsExporter {
            addr: "127.0.0.1:9000".parse().unwrap(),
            reason: "address in use".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "metrics exporter on 127.0.0.1:9000 unavailable: address in use"
        );
    }
}
