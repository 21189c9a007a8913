//! Request-scoped decode failures. Any of these rejects the whole request.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unsupported content-encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("failed to decompress {encoding} body: {source}")]
    Decompress {
        encoding: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("decompressed body exceeds {limit} bytes")]
    TooLarge { limit: usize },

    #[error("invalid protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecodeError {
    /// Short machine-readable code for logs.
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::UnsupportedEncoding(_) => "unsupported_encoding",
            DecodeError::Decompress { .. } => "decompress_failed",
            DecodeError::TooLarge { .. } => "body_too_large",
            DecodeError::Protobuf(_) => "invalid_protobuf",
            DecodeError::Json(_) => "invalid_json",
        }
    }
}
