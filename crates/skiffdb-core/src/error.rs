use thiserror::Error;

/// Everything that can go wrong inside the versioning and replication core.
///
/// Each variant maps onto a `(domain, code, message)` triple so that errors
/// relayed over the wire, or surfaced through status callbacks, keep a stable
/// identity across peers and releases.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: document update conflict")]
    Conflict,

    #[error("invalid revision id: {0}")]
    BadRevisionId(String),

    #[error("corrupt revision data: {0}")]
    CorruptRevisionData(String),

    #[error("invalid revision history: {0}")]
    BadHistory(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    #[error("property encryption: {0}")]
    Crypto(String),

    #[error("delta not applicable: {0}")]
    BadDelta(String),

    #[error("storage error: {0}")]
    Store(String),

    #[error("transaction busy")]
    TransactionBusy,

    #[error("network error: {code:?}: {message}")]
    Network { code: NetworkError, message: String },

    #[error("websocket error {code}: {message}")]
    WebSocket { code: u16, message: String },

    /// An error relayed by the remote peer inside a reply message.
    #[error("remote error {domain}/{code}: {message}")]
    Remote {
        domain: String,
        code: i32,
        message: String,
    },

    #[error("operation timed out")]
    Timeout,

    #[error("replicator stopped")]
    Stopped,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Network-level failure classification, used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkError {
    DnsFailure,
    Timeout,
    ConnectionReset,
    ConnectionRefused,
    TooManyRedirects,
    InvalidRedirect,
    Unreachable,
    InvalidUrl,
    Unknown,
}

impl NetworkError {
    pub fn code(self) -> i32 {
        match self {
            NetworkError::DnsFailure => 2,
            NetworkError::Timeout => 3,
            NetworkError::InvalidUrl => 5,
            NetworkError::TooManyRedirects => 6,
            NetworkError::Unreachable => 8,
            NetworkError::ConnectionReset => 9,
            NetworkError::ConnectionRefused => 12,
            NetworkError::InvalidRedirect => 16,
            NetworkError::Unknown => 1,
        }
    }
}

/// The error domains visible in status callbacks and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDomain {
    Skiff,
    Posix,
    Network,
    WebSocket,
    Codec,
    Store,
}

impl ErrorDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorDomain::Skiff => "SkiffDB",
            ErrorDomain::Posix => "POSIX",
            ErrorDomain::Network => "Network",
            ErrorDomain::WebSocket => "WebSocket",
            ErrorDomain::Codec => "Codec",
            ErrorDomain::Store => "Store",
        }
    }
}

impl Error {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Error::Io(_) => ErrorDomain::Posix,
            Error::Network { .. } => ErrorDomain::Network,
            Error::WebSocket { .. } => ErrorDomain::WebSocket,
            Error::Codec(_) => ErrorDomain::Codec,
            Error::Store(_) | Error::TransactionBusy => ErrorDomain::Store,
            Error::Remote { domain, .. } => match domain.as_str() {
                "Network" => ErrorDomain::Network,
                "WebSocket" => ErrorDomain::WebSocket,
                "POSIX" => ErrorDomain::Posix,
                _ => ErrorDomain::Skiff,
            },
            _ => ErrorDomain::Skiff,
        }
    }

    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound(_) => 404,
            Error::Conflict => 409,
            Error::BadRevisionId(_) => 400,
            Error::BadHistory(_) => 400,
            Error::InvalidParameter(_) => 400,
            Error::CorruptRevisionData(_) => 500,
            Error::Unsupported(_) => 501,
            Error::Crypto(_) => 22,
            Error::BadDelta(_) => 23,
            Error::Store(_) => 21,
            Error::TransactionBusy => 24,
            Error::Network { code, .. } => code.code(),
            Error::WebSocket { code, .. } => i32::from(*code),
            Error::Remote { code, .. } => *code,
            Error::Timeout => NetworkError::Timeout.code(),
            Error::Stopped => 20,
            Error::Io(e) => e.raw_os_error().unwrap_or(-1),
            Error::Codec(_) => 1,
        }
    }

    /// True for failures that the replicator may retry after a backoff,
    /// as opposed to fatal ones that stop it.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network { code, .. } => !matches!(
                code,
                NetworkError::TooManyRedirects
                    | NetworkError::InvalidRedirect
                    | NetworkError::InvalidUrl
            ),
            Error::Timeout | Error::TransactionBusy => true,
            // A 5xx from the peer is a server hiccup, not a protocol failure.
            Error::Remote { code, .. } => (500..600).contains(code),
            _ => false,
        }
    }

    /// Wire representation used when relaying an error in a reply message.
    pub fn to_wire(&self) -> (String, i32, String) {
        (
            self.domain().as_str().to_string(),
            self.code(),
            self.to_string(),
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_and_codes() {
        assert_eq!(Error::Conflict.domain(), ErrorDomain::Skiff);
        assert_eq!(Error::Conflict.code(), 409);
        let e = Error::Network {
            code: NetworkError::TooManyRedirects,
            message: "loop".into(),
        };
        assert_eq!(e.domain(), ErrorDomain::Network);
        assert!(!e.is_transient());
    }

    #[test]
    fn transient_classification() {
        let reset = Error::Network {
            code: NetworkError::ConnectionReset,
            message: "reset".into(),
        };
        assert!(reset.is_transient());
        assert!(Error::Timeout.is_transient());
        assert!(
            Error::Remote {
                domain: "HTTP".into(),
                code: 503,
                message: "unavailable".into()
            }
            .is_transient()
        );
        assert!(
            !Error::Remote {
                domain: "HTTP".into(),
                code: 403,
                message: "forbidden".into()
            }
            .is_transient()
        );
        assert!(!Error::Conflict.is_transient());
    }
}
