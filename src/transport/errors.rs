// ============================================================================
// Transport Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid endpoint {endpoint}: {source}")]
    InvalidEndpoint {
        endpoint: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("Connection failed: {0}")]
    Connect(#[from] tonic::transport::Error),

    #[error("RPC failed: {0}")]
    Status(#[from] tonic::Status),

    #[error("Payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream closed")]
    Closed,
}
