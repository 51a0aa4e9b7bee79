//! Error taxonomy for the dispatch pipeline

/// Main error type for dispatch operations.
///
/// `PolicyDenied` and `MalformedRequest` short-circuit at begin time with a
/// synthetic failure delivered straight to the consumer; `TransportError`
/// and `Aborted` surface through the completion callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The security policy denied the URL or an uploaded file
    #[error("request denied by security policy")]
    PolicyDenied,
    /// The transport failed with a mapped network error code
    #[error("transport failed with error code {0}")]
    TransportError(i32),
    /// The request was explicitly cancelled
    #[error("request aborted")]
    Aborted,
    /// The server demanded credentials that were never supplied
    #[error("authentication required")]
    AuthRequired,
    /// A certificate error the policy callback refused to override
    #[error("ssl error {0}")]
    SslError(i32),
    /// A request the pipeline cannot service (e.g. unhandleable scheme)
    #[error("malformed request: {0}")]
    MalformedRequest(String),
}

/// Convenience Result type for dispatch operations
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Final status delivered through `on_response_completed`.
///
/// `Ok(())` is a successful load; every failure carries the taxonomy value
/// that callers can match on.
pub type CompletionStatus = Result<()>;
