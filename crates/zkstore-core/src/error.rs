//! Error types for the storage adapter.

use thiserror::Error;

use crate::ensemble::NativeCode;

/// Result type alias for adapter operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Why the adapter could not reach a usable session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// No connected session appeared (or a call did not return) in time.
    #[error("timed out after {waited_ms}ms waiting for the ensemble")]
    Timeout {
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// The connection dropped while a call was in flight.
    #[error("connection to the ensemble was lost")]
    Lost,

    /// The adapter has been shut down.
    #[error("session manager is closed")]
    Closed,

    /// Bounded reconnection gave up.
    #[error("gave up reconnecting after {attempts} attempts")]
    GaveUp {
        /// Number of connection attempts made.
        attempts: u32,
    },
}

/// Error variants surfaced by storage operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The object key cannot be represented as a znode path.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath {
        /// The offending path as given by the caller.
        path: String,
        /// What is wrong with it.
        reason: String,
    },

    /// No object or directory exists at the path.
    #[error("not found: {path}")]
    NotFound {
        /// The path that was looked up.
        path: String,
    },

    /// The payload exceeds the node data size limit.
    #[error("payload too large: {size} bytes (max {max_size})")]
    PayloadTooLarge {
        /// Size of the rejected payload.
        size: usize,
        /// Configured maximum.
        max_size: usize,
    },

    /// Attempted a non-recursive delete of a directory with children.
    #[error("directory not empty: {path}")]
    NotEmpty {
        /// The directory that still has children.
        path: String,
    },

    /// The session the operation relied on has expired.
    #[error("session {session_id} expired")]
    SessionExpired {
        /// Local id of the expired session.
        session_id: u64,
    },

    /// The ensemble could not be reached.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The ensemble answered with a code the adapter does not map.
    #[error("unexpected ensemble result for '{path}': {code}")]
    Unexpected {
        /// The object path of the failed call.
        path: String,
        /// The native result code.
        code: NativeCode,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// Maps a native result code for a call against `path`.
    ///
    /// Codes whose meaning depends on the operation (such as `NodeExists`)
    /// are handled by the caller before reaching this point; here they are
    /// reported as `Unexpected`.
    pub fn from_native(code: NativeCode, path: &str, session_id: u64) -> Self {
        match code {
            NativeCode::NoNode => StoreError::NotFound {
                path: path.to_string(),
            },
            NativeCode::NotEmpty => StoreError::NotEmpty {
                path: path.to_string(),
            },
            NativeCode::ConnectionLoss => StoreError::Connection(ConnectionError::Lost),
            NativeCode::OperationTimeout { waited_ms } => {
                StoreError::Connection(ConnectionError::Timeout { waited_ms })
            }
            NativeCode::SessionExpired => StoreError::SessionExpired { session_id },
            NativeCode::ClientClosed => StoreError::Connection(ConnectionError::Closed),
            NativeCode::NodeExists
            | NativeCode::BadVersion
            | NativeCode::NoAuth
            | NativeCode::Other(_) => StoreError::Unexpected {
                path: path.to_string(),
                code,
            },
        }
    }

    /// Whether re-issuing the operation later can succeed.
    ///
    /// Connection failures and session expiry are transient unless the
    /// session manager has stopped reconnecting.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Connection(ConnectionError::Closed)
            | StoreError::Connection(ConnectionError::GaveUp { .. }) => false,
            StoreError::Connection(_) => true,
            StoreError::SessionExpired { .. } => true,
            StoreError::InvalidPath { .. }
            | StoreError::NotFound { .. }
            | StoreError::PayloadTooLarge { .. }
            | StoreError::NotEmpty { .. }
            | StoreError::Unexpected { .. }
            | StoreError::Config(_) => false,
        }
    }

    /// Returns true for `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_node_maps_to_not_found() {
        let err = StoreError::from_native(NativeCode::NoNode, "/a/b", 1);
        assert_eq!(
            err,
            StoreError::NotFound {
                path: "/a/b".to_string()
            }
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_connection_codes() {
        assert_eq!(
            StoreError::from_native(NativeCode::ConnectionLoss, "/x", 1),
            StoreError::Connection(ConnectionError::Lost)
        );
        assert_eq!(
            StoreError::from_native(NativeCode::OperationTimeout { waited_ms: 50 }, "/x", 1),
            StoreError::Connection(ConnectionError::Timeout { waited_ms: 50 })
        );
        assert_eq!(
            StoreError::from_native(NativeCode::ClientClosed, "/x", 1),
            StoreError::Connection(ConnectionError::Closed)
        );
    }

    #[test]
    fn test_session_expired_carries_session_id() {
        assert_eq!(
            StoreError::from_native(NativeCode::SessionExpired, "/x", 7),
            StoreError::SessionExpired { session_id: 7 }
        );
    }

    #[test]
    fn test_unmapped_codes_are_unexpected() {
        for code in [
            NativeCode::NodeExists,
            NativeCode::BadVersion,
            NativeCode::NoAuth,
            NativeCode::Other("marshalling error".to_string()),
        ] {
            let err = StoreError::from_native(code.clone(), "/x", 1);
            assert_eq!(
                err,
                StoreError::Unexpected {
                    path: "/x".to_string(),
                    code
                }
            );
        }
    }

    #[test]
    fn test_is_retryable() {
        assert!(StoreError::Connection(ConnectionError::Lost).is_retryable());
        assert!(StoreError::Connection(ConnectionError::Timeout { waited_ms: 1 }).is_retryable());
        assert!(StoreError::SessionExpired { session_id: 1 }.is_retryable());

        assert!(!StoreError::Connection(ConnectionError::Closed).is_retryable());
        assert!(!StoreError::Connection(ConnectionError::GaveUp { attempts: 3 }).is_retryable());
        assert!(!StoreError::NotFound {
            path: "a".to_string()
        }
        .is_retryable());
        assert!(!StoreError::PayloadTooLarge {
            size: 2,
            max_size: 1
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = StoreError::PayloadTooLarge {
            size: 1001,
            max_size: 1000,
        };
        assert_eq!(err.to_string(), "payload too large: 1001 bytes (max 1000)");
        let err = StoreError::Connection(ConnectionError::Timeout { waited_ms: 250 });
        assert_eq!(
            err.to_string(),
            "timed out after 250ms waiting for the ensemble"
        );
    }
}
