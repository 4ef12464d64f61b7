//! The seam between the adapter and a ZooKeeper client.
//!
//! The session manager and the operation executor only talk to the ensemble
//! through [`Connector`] and [`Connection`]. The production implementation
//! lives in [`crate::zk`]; [`crate::sim`] provides an in-memory ensemble for
//! tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest request an ensemble accepts with the default `jute.maxbuffer`.
pub const MAX_REQUEST_LEN: usize = 0xfffff;

/// Result codes a znode call can fail with.
///
/// This is the adapter's view of the client's error set. Translating a client
/// error into this enum happens in exactly one place per client
/// implementation, with [`NativeCode::Other`] as the explicit catch-all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NativeCode {
    /// The znode does not exist.
    #[error("no node")]
    NoNode,
    /// The znode already exists.
    #[error("node exists")]
    NodeExists,
    /// The znode has children.
    #[error("not empty")]
    NotEmpty,
    /// Version check failed.
    #[error("bad version")]
    BadVersion,
    /// Not authorised by the znode ACL.
    #[error("no auth")]
    NoAuth,
    /// The connection dropped; the outcome of the call is unknown.
    #[error("connection loss")]
    ConnectionLoss,
    /// The session expired on the server.
    #[error("session expired")]
    SessionExpired,
    /// The call did not complete within the operation timeout.
    #[error("operation timeout after {waited_ms}ms")]
    OperationTimeout {
        /// Elapsed time before giving up.
        waited_ms: u64,
    },
    /// The client was closed locally.
    #[error("client closed")]
    ClientClosed,
    /// Any other client error, kept verbatim for diagnostics.
    #[error("{0}")]
    Other(String),
}

/// Znode metadata as returned by the ensemble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZnodeStat {
    /// Data version, bumped by every `set`.
    pub version: i32,
    /// Length of the znode data in bytes.
    pub data_length: i32,
    /// Number of direct children.
    pub num_children: i32,
    /// Creation time, milliseconds since the epoch.
    pub ctime: i64,
    /// Last modification time, milliseconds since the epoch.
    pub mtime: i64,
}

impl ZnodeStat {
    /// A directory marker carries no data and has never been `set`.
    pub fn is_dir_marker(&self) -> bool {
        self.data_length == 0 && self.version == 0
    }
}

/// Connection-state notifications pushed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transient loss; the client is resuming the same session.
    Disconnected,
    /// The session was resumed after a transient loss.
    Reconnected {
        /// Whether the server we are attached to is read-only.
        read_only: bool,
    },
    /// The server expired the session; a new one is required.
    Expired,
    /// The client closed and will emit nothing else.
    Closed,
}

/// Everything a connector needs to establish a session.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    /// `host:port` members of the ensemble.
    pub endpoints: Vec<String>,
    /// Negotiated session timeout.
    pub session_timeout: Duration,
    /// Timeout for establishing the TCP connection and handshake.
    pub connection_timeout: Duration,
    /// Digest credentials (`user:password`), if any.
    pub digest_auth: Option<Vec<u8>>,
}

impl ConnectSettings {
    /// The comma-separated connect string understood by ZooKeeper clients.
    pub fn connect_string(&self) -> String {
        self.endpoints.join(",")
    }
}

/// A freshly established session.
pub struct Established {
    /// Znode operations bound to the new session.
    pub connection: Arc<dyn Connection>,
    /// State changes of this session, in order.
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl fmt::Debug for Established {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Established")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}

/// Opens sessions against an ensemble.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes a brand new session.
    async fn connect(&self, settings: &ConnectSettings) -> Result<Established, NativeCode>;
}

/// Znode operations bound to one session.
///
/// Every znode is persistent and created with the ACL chosen at connect time.
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    /// Reads znode data and metadata.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, ZnodeStat), NativeCode>;

    /// Overwrites znode data regardless of version.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<ZnodeStat, NativeCode>;

    /// Creates a persistent znode; the parent must exist.
    async fn create(&self, path: &str, data: &[u8]) -> Result<(), NativeCode>;

    /// Deletes a childless znode regardless of version.
    async fn delete(&self, path: &str) -> Result<(), NativeCode>;

    /// Returns metadata, or `None` if the znode does not exist.
    async fn stat(&self, path: &str) -> Result<Option<ZnodeStat>, NativeCode>;

    /// Returns the names of direct children, unordered.
    async fn children(&self, path: &str) -> Result<Vec<String>, NativeCode>;

    /// The ensemble member the session is attached to, when known.
    fn member(&self) -> Option<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_marker() {
        let dir = ZnodeStat::default();
        assert!(dir.is_dir_marker());

        let empty_object = ZnodeStat {
            version: 1,
            ..Default::default()
        };
        assert!(!empty_object.is_dir_marker());

        let object = ZnodeStat {
            data_length: 3,
            ..Default::default()
        };
        assert!(!object.is_dir_marker());
    }

    #[test]
    fn test_connect_string() {
        let settings = ConnectSettings {
            endpoints: vec!["zk1:2181".to_string(), "zk2:2181".to_string()],
            session_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(5),
            digest_auth: None,
        };
        assert_eq!(settings.connect_string(), "zk1:2181,zk2:2181");
    }

    #[test]
    fn test_native_code_display() {
        assert_eq!(NativeCode::NoNode.to_string(), "no node");
        assert_eq!(
            NativeCode::OperationTimeout { waited_ms: 10 }.to_string(),
            "operation timeout after 10ms"
        );
        assert_eq!(NativeCode::Other("boom".to_string()).to_string(), "boom");
    }
}
