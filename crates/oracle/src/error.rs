use thiserror::Error;

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("oracle returned {status} for {endpoint}: {body}")]
    Status {
        endpoint: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to parse oracle response: {0}")]
    Parse(String),

    #[error("empty action space")]
    EmptyActionSpace,
}
