//! [`Connector`] over the `zookeeper-client` crate.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use zookeeper_client as zk;

use crate::ensemble::{
    ConnectSettings, Connection, Connector, Established, NativeCode, SessionEvent, ZnodeStat,
};

/// Auth scheme used for `username:password` credentials.
pub const ZOOKEEPER_AUTH_SCHEME: &str = "digest";

/// Opens real sessions against a ZooKeeper ensemble.
#[derive(Debug, Clone, Default)]
pub struct ZkConnector;

impl ZkConnector {
    /// New connector.
    pub fn new() -> Self {
        Self
    }
}

/// Translates a client error into the adapter's result codes.
fn native_code(err: zk::Error) -> NativeCode {
    match err {
        zk::Error::NoNode => NativeCode::NoNode,
        zk::Error::NodeExists => NativeCode::NodeExists,
        zk::Error::NotEmpty => NativeCode::NotEmpty,
        zk::Error::BadVersion => NativeCode::BadVersion,
        zk::Error::NoAuth => NativeCode::NoAuth,
        zk::Error::ConnectionLoss => NativeCode::ConnectionLoss,
        zk::Error::SessionExpired => NativeCode::SessionExpired,
        zk::Error::ClientClosed => NativeCode::ClientClosed,
        other => NativeCode::Other(other.to_string()),
    }
}

fn znode_stat(stat: &zk::Stat) -> ZnodeStat {
    ZnodeStat {
        version: stat.version,
        data_length: stat.data_length,
        num_children: stat.num_children,
        ctime: stat.ctime,
        mtime: stat.mtime,
    }
}

fn session_event(state: zk::SessionState) -> Option<SessionEvent> {
    match state {
        zk::SessionState::Disconnected => Some(SessionEvent::Disconnected),
        zk::SessionState::SyncConnected => Some(SessionEvent::Reconnected { read_only: false }),
        zk::SessionState::ConnectedReadOnly => {
            Some(SessionEvent::Reconnected { read_only: true })
        }
        zk::SessionState::Expired => Some(SessionEvent::Expired),
        zk::SessionState::Closed => Some(SessionEvent::Closed),
        zk::SessionState::AuthFailed => {
            error!("ensemble rejected the session credentials");
            Some(SessionEvent::Closed)
        }
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

/// ACL for new znodes: creator-only once authenticated, world-anyone otherwise.
fn create_acls(authenticated: bool) -> zk::Acls<'static> {
    if authenticated {
        zk::Acls::creator_all()
    } else {
        zk::Acls::anyone_all()
    }
}

#[async_trait]
impl Connector for ZkConnector {
    async fn connect(&self, settings: &ConnectSettings) -> Result<Established, NativeCode> {
        let cluster = settings.connect_string();
        let client = zk::Client::builder()
            .with_session_timeout(settings.session_timeout)
            .with_connection_timeout(settings.connection_timeout)
            .connect(&cluster)
            .await
            .map_err(native_code)?;

        match &settings.digest_auth {
            Some(auth) => {
                client
                    .auth(ZOOKEEPER_AUTH_SCHEME.to_string(), auth.clone())
                    .await
                    .map_err(native_code)?;
            }
            None => warn!(
                cluster = %cluster,
                "no credentials configured, znodes are created with the world-anyone ACL"
            ),
        }
        let acl = create_acls(settings.digest_auth.is_some());

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = client.state_watcher();
        tokio::spawn(async move {
            loop {
                let state = watcher.changed().await;
                debug!(?state, "zookeeper session state");
                let Some(event) = session_event(state) else {
                    continue;
                };
                let terminal = matches!(event, SessionEvent::Expired | SessionEvent::Closed);
                if tx.send(event).is_err() || terminal {
                    break;
                }
            }
        });

        Ok(Established {
            connection: Arc::new(ZkConnection {
                client,
                cluster,
                acl,
            }),
            events: rx,
        })
    }
}

/// Znode calls on one `zookeeper-client` session.
pub struct ZkConnection {
    client: zk::Client,
    cluster: String,
    acl: zk::Acls<'static>,
}

impl fmt::Debug for ZkConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZkConnection")
            .field("cluster", &self.cluster)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connection for ZkConnection {
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, ZnodeStat), NativeCode> {
        let (data, stat) = self.client.get_data(path).await.map_err(native_code)?;
        Ok((data, znode_stat(&stat)))
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<ZnodeStat, NativeCode> {
        let stat = self
            .client
            .set_data(path, data, None)
            .await
            .map_err(native_code)?;
        Ok(znode_stat(&stat))
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), NativeCode> {
        let options = zk::CreateMode::Persistent.with_acls(self.acl);
        self.client
            .create(path, data, &options)
            .await
            .map_err(native_code)?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), NativeCode> {
        self.client.delete(path, None).await.map_err(native_code)
    }

    async fn stat(&self, path: &str) -> Result<Option<ZnodeStat>, NativeCode> {
        let stat = self.client.check_stat(path).await.map_err(native_code)?;
        Ok(stat.as_ref().map(znode_stat))
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, NativeCode> {
        self.client.list_children(path).await.map_err(native_code)
    }

    fn member(&self) -> Option<String> {
        // The client does not expose which server it is attached to.
        Some(self.cluster.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_code_mapping() {
        assert_eq!(native_code(zk::Error::NoNode), NativeCode::NoNode);
        assert_eq!(native_code(zk::Error::NodeExists), NativeCode::NodeExists);
        assert_eq!(native_code(zk::Error::NotEmpty), NativeCode::NotEmpty);
        assert_eq!(
            native_code(zk::Error::ConnectionLoss),
            NativeCode::ConnectionLoss
        );
        assert_eq!(
            native_code(zk::Error::SessionExpired),
            NativeCode::SessionExpired
        );
        assert!(matches!(
            native_code(zk::Error::InvalidAcl),
            NativeCode::Other(_)
        ));
    }

    #[test]
    fn test_create_options_for_both_acls() {
        for authenticated in [true, false] {
            let acls = create_acls(authenticated);
            let _options = zk::CreateMode::Persistent.with_acls(acls);
            // Acls is Copy; the connection reuses it for every create.
            let _again = zk::CreateMode::Persistent.with_acls(acls);
        }
    }

    #[test]
    fn test_session_events() {
        assert_eq!(
            session_event(zk::SessionState::Disconnected),
            Some(SessionEvent::Disconnected)
        );
        assert_eq!(
            session_event(zk::SessionState::ConnectedReadOnly),
            Some(SessionEvent::Reconnected { read_only: true })
        );
        assert_eq!(
            session_event(zk::SessionState::Expired),
            Some(SessionEvent::Expired)
        );
        assert_eq!(
            session_event(zk::SessionState::AuthFailed),
            Some(SessionEvent::Closed)
        );
    }
}
