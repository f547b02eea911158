use std::net::IpAddr;

/// Per-connection error taxonomy.
///
/// Everything raised inside a connection task ends up here (possibly wrapped
/// in an `anyhow::Error` with more context); the task logs it and exits, the
/// process keeps serving.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to authenticate")]
    FailAuth,

    #[error("replay attack detected")]
    ReplayAttack,

    #[error("invalid metadata")]
    InvalidMetadata,

    #[error("invalid address")]
    InvalidAddress,

    #[error("passage abuse: from {this} and {conflict}: contention detected")]
    Contention { this: IpAddr, conflict: IpAddr },

    #[error("passage abuse: {0}")]
    PassageAbuse(&'static str),

    #[error("request to dial a private address: {0}")]
    DialPrivateAddress(IpAddr),

    #[error("i/o deadline exceeded")]
    Timeout,
}

impl ProxyError {
    /// Replays and abuses are logged at warn, timeouts at debug, the rest at
    /// info. Used by the accept loops to keep the log noise proportionate.
    pub fn is_hostile(&self) -> bool {
        matches!(
            self,
            ProxyError::ReplayAttack | ProxyError::Contention { .. } | ProxyError::PassageAbuse(_)
        )
    }

    pub fn is_quiet(&self) -> bool {
        matches!(self, ProxyError::Timeout)
    }
}
