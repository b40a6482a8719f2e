use thiserror::Error;

/// Error kinds the core distinguishes for teardown/ticket-writing purposes.
///
/// Most call-path failures are carried as `anyhow::Error` (matching the
/// teacher's idiom); this enum exists only where the *kind* of failure
/// changes downstream behavior (§7).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("connection closed")]
    ConnectionClosed,

    #[error("provider timed out after {0:?}")]
    ProviderTimeout(std::time::Duration),

    #[error("provider error: {0}")]
    ProviderError(String),

    #[error("failed to parse response: {0}")]
    ParseError(String),

    #[error("directory error: {0}")]
    DirectoryError(String),

    #[error("scan traffic detected on AudioSocket port")]
    ScanTraffic,

    #[error("admission cap exceeded")]
    CapExceeded,

    #[error("fatal call error: {0}")]
    Fatal(String),

    #[error("required configuration missing: {0}")]
    ConfigMissing(String),
}

impl CoreError {
    /// Whether this error should force the dialog into TRANSFER on its
    /// next step (§7: "Repeated failures over one call raise ForceTransfer").
    pub fn forces_transfer(&self) -> bool {
        matches!(self, CoreError::ProviderTimeout(_) | CoreError::ProviderError(_))
    }
}
