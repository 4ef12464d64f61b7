//! Object operations over znodes.
//!
//! [`ZkStore`] resolves every key through the [`PathMapper`], runs the znode
//! calls on the current session and maps native result codes onto
//! [`StoreError`]. Idempotent calls are re-issued once after a connection
//! loss, and only on the session they were first sent on; writes and deletes
//! surface the loss to the caller.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::StoreConfig;
use crate::ensemble::{Connector, NativeCode, ZnodeStat};
use crate::error::{Result, StoreError};
use crate::health::HealthStats;
use crate::path::{ObjectPath, PathMapper, ZnodePath};
use crate::session::{CallResult, SessionHandle, SessionManager, SessionStats, SessionStatus};
use crate::zk::ZkConnector;

/// Set-or-create passes a write makes while its node keeps vanishing.
const WRITE_ROUNDS: usize = 3;

/// Metadata of an object or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Normalized object path.
    pub path: ObjectPath,
    /// Payload size in bytes; zero for directories.
    pub content_length: u64,
    /// Whether the entry is a directory marker (or the store root).
    pub is_dir: bool,
    /// Last modification time.
    pub last_modified: Option<DateTime<Utc>>,
    /// Znode data version.
    pub version: i32,
    /// Number of direct children.
    pub children: u32,
}

impl Entry {
    fn from_stat(path: ObjectPath, stat: &ZnodeStat) -> Self {
        let is_dir = path.is_root() || stat.is_dir_marker();
        Self {
            content_length: if is_dir { 0 } else { stat.data_length.max(0) as u64 },
            is_dir,
            last_modified: Utc.timestamp_millis_opt(stat.mtime).single(),
            version: stat.version,
            children: stat.num_children.max(0) as u32,
            path,
        }
    }

    /// Last path segment; empty for the root.
    pub fn name(&self) -> &str {
        self.path.name().unwrap_or_default()
    }
}

/// One page of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Entries in name order.
    pub entries: Vec<Entry>,
    /// Name to pass as `start_after` for the next page; `None` on the last
    /// page.
    pub next: Option<String>,
}

struct StoreInner {
    sessions: SessionManager,
    mapper: PathMapper,
    max_payload_size: usize,
    root_ready: OnceCell<()>,
}

/// Object storage over a ZooKeeper ensemble.
///
/// Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct ZkStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ZkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZkStore")
            .field("root", self.inner.mapper.root())
            .field("sessions", &self.inner.sessions)
            .finish()
    }
}

impl ZkStore {
    /// Opens a store against a real ensemble.
    ///
    /// The session is established in the background; the first operation
    /// waits for it. Must be called from within a tokio runtime.
    pub fn new(config: StoreConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(ZkConnector::new()))
    }

    /// Opens a store through the given connector.
    pub fn with_connector(config: StoreConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let mapper = config.path_mapper()?;
        info!(
            endpoints = %config.endpoints.join(","),
            root = %mapper.root(),
            "opening zookeeper store"
        );
        let sessions = SessionManager::start(connector, &config);
        Ok(Self {
            inner: Arc::new(StoreInner {
                sessions,
                mapper,
                max_payload_size: config.max_payload_size,
                root_ready: OnceCell::new(),
            }),
        })
    }

    /// The root znode.
    pub fn root(&self) -> &ZnodePath {
        self.inner.mapper.root()
    }

    /// Largest accepted payload.
    pub fn max_payload_size(&self) -> usize {
        self.inner.max_payload_size
    }

    /// Current session status.
    pub fn session_status(&self) -> SessionStatus {
        self.inner.sessions.status()
    }

    /// Session supervisor counters.
    pub fn session_stats(&self) -> SessionStats {
        self.inner.sessions.stats()
    }

    /// Health of znode calls.
    pub fn health(&self) -> HealthStats {
        self.inner.sessions.health().stats()
    }

    /// The underlying session manager.
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    /// Closes the session. Every later operation fails with
    /// `ConnectionError::Closed`.
    pub async fn shutdown(&self) {
        self.inner.sessions.shutdown().await;
    }

    /// Reads an object.
    pub async fn read(&self, key: &str) -> Result<Bytes> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;
        let znode = &znode;
        let result = self
            .idempotent(&session, |s| async move { s.get_data(znode).await })
            .await?;
        match result {
            Ok((_, stat)) if path.is_root() || stat.is_dir_marker() => Err(not_found(&path)),
            Ok((data, _)) => Ok(Bytes::from(data)),
            Err(code) => Err(fail(code, &path, &session)),
        }
    }

    /// Writes an object, creating missing parent directories.
    ///
    /// An existing object is overwritten. The final create or set is not
    /// retried; a connection loss leaves the outcome unknown and is returned
    /// as a retryable error. A node that keeps being removed underneath the
    /// write ends in `Unexpected`.
    pub async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        if path.is_root() {
            return Err(StoreError::InvalidPath {
                path: key.to_string(),
                reason: "cannot write to the root".to_string(),
            });
        }
        if data.len() > self.inner.max_payload_size {
            return Err(StoreError::PayloadTooLarge {
                size: data.len(),
                max_size: self.inner.max_payload_size,
            });
        }
        let session = self.session().await?;

        for _ in 0..WRITE_ROUNDS {
            if self.write_once(&session, &path, &znode, data).await? {
                return Ok(());
            }
            debug!(path = %path, "node removed during write, starting over");
        }
        Err(StoreError::Unexpected {
            path: path.to_string(),
            code: NativeCode::NoNode,
        })
    }

    /// One set-or-create pass. Returns `false` when the node was created by
    /// someone else and removed again before it could be set.
    async fn write_once(
        &self,
        session: &SessionHandle,
        path: &ObjectPath,
        znode: &ZnodePath,
        data: &[u8],
    ) -> Result<bool> {
        match session.set_data(znode, data).await {
            Ok(_) => return Ok(true),
            Err(NativeCode::NoNode) => {}
            Err(code) => return Err(fail(code, path, session)),
        }

        let created = match session.create(znode, data).await {
            Err(NativeCode::NoNode) => {
                self.create_parents(session, path).await?;
                session.create(znode, data).await
            }
            other => other,
        };
        let code = match created {
            Ok(()) if data.is_empty() => {
                // Move the version past zero so the object is not a directory.
                match session.set_data(znode, data).await {
                    // Deleted right after our create; the write still happened.
                    Ok(_) | Err(NativeCode::NoNode) => return Ok(true),
                    Err(code) => code,
                }
            }
            Ok(()) => return Ok(true),
            Err(NativeCode::NodeExists) => {
                debug!(path = %path, "lost create race, overwriting");
                match session.set_data(znode, data).await {
                    Ok(_) => return Ok(true),
                    Err(NativeCode::NoNode) => return Ok(false),
                    Err(code) => code,
                }
            }
            Err(code) => code,
        };
        Err(fail(code, path, session))
    }

    /// Deletes an object or an empty directory.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        if path.is_root() {
            return Err(StoreError::InvalidPath {
                path: key.to_string(),
                reason: "cannot delete the root".to_string(),
            });
        }
        let session = self.session().await?;
        session
            .delete(&znode)
            .await
            .map_err(|code| fail(code, &path, &session))
    }

    /// Deletes a path and everything below it, depth first.
    ///
    /// On the root every child is removed and the root itself is kept.
    pub async fn delete_all(&self, key: &str) -> Result<()> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;

        let mut pending = vec![(path.clone(), znode)];
        let mut order = Vec::new();
        while let Some((dir, dir_znode)) = pending.pop() {
            let listed = {
                let dir_znode = &dir_znode;
                self.idempotent(&session, |s| async move { s.children(dir_znode).await })
                    .await?
            };
            match listed {
                Ok(names) => {
                    for name in names {
                        if let Some(child) = self.child(&dir, &name) {
                            pending.push(child);
                        }
                    }
                }
                Err(NativeCode::NoNode) if dir != path => continue,
                Err(code) => return Err(fail(code, &dir, &session)),
            }
            order.push((dir, dir_znode));
        }

        let mut removed = 0usize;
        for (node, node_znode) in order.into_iter().rev() {
            if node.is_root() {
                continue;
            }
            match session.delete(&node_znode).await {
                Ok(()) => removed += 1,
                Err(NativeCode::NoNode) => {}
                Err(code) => return Err(fail(code, &node, &session)),
            }
        }
        debug!(path = %path, removed, "recursive delete");
        Ok(())
    }

    /// Metadata for a path.
    pub async fn stat(&self, key: &str) -> Result<Entry> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;
        let znode = &znode;
        let result = self
            .idempotent(&session, |s| async move { s.stat(znode).await })
            .await?;
        match result {
            Ok(Some(stat)) => Ok(Entry::from_stat(path, &stat)),
            Ok(None) => Err(not_found(&path)),
            Err(code) => Err(fail(code, &path, &session)),
        }
    }

    /// Whether an object or directory exists at `key`.
    pub async fn exists(&self, key: &str) -> Result<bool> {
        match self.stat(key).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Direct children of `key`, sorted by name.
    pub async fn list(&self, key: &str) -> Result<Vec<Entry>> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;
        let names = self.child_names(&session, &path, &znode).await?;
        self.stat_children(&session, &path, names).await
    }

    /// A page of at most `limit` children whose names sort after
    /// `start_after`.
    pub async fn list_page(
        &self,
        key: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ListPage> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;
        let mut names = self.child_names(&session, &path, &znode).await?;
        if let Some(cursor) = start_after {
            names.retain(|name| name.as_str() > cursor);
        }
        let limit = limit.max(1);
        let next = (names.len() > limit).then(|| names[limit - 1].clone());
        names.truncate(limit);
        let entries = self.stat_children(&session, &path, names).await?;
        Ok(ListPage { entries, next })
    }

    /// Creates a directory and any missing ancestors. Existing nodes are
    /// left untouched.
    pub async fn create_dir(&self, key: &str) -> Result<()> {
        let (path, znode) = self.inner.mapper.resolve(key)?;
        let session = self.session().await?;
        if path.is_root() {
            return Ok(());
        }
        self.create_parents(&session, &path).await?;
        self.create_if_absent(&session, &path, &znode).await
    }

    async fn session(&self) -> Result<SessionHandle> {
        let session = self.inner.sessions.acquire().await?;
        self.inner
            .root_ready
            .get_or_try_init(|| self.create_root(&session))
            .await?;
        Ok(session)
    }

    async fn create_root(&self, session: &SessionHandle) -> Result<()> {
        let root = ObjectPath::root();
        for znode in self.inner.mapper.root_chain() {
            self.create_if_absent(session, &root, &znode).await?;
        }
        debug!(root = %self.inner.mapper.root(), "store root ready");
        Ok(())
    }

    /// Runs an idempotent call, re-issuing it once on the same session after
    /// a connection loss.
    async fn idempotent<T, F, Fut>(
        &self,
        session: &SessionHandle,
        op: F,
    ) -> Result<CallResult<T>>
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: Future<Output = CallResult<T>>,
    {
        match op(session.clone()).await {
            Err(NativeCode::ConnectionLoss) => {
                let resumed = self.inner.sessions.reacquire(session).await?;
                debug!(session = resumed.id(), "retrying after connection loss");
                Ok(op(resumed).await)
            }
            other => Ok(other),
        }
    }

    async fn create_if_absent(
        &self,
        session: &SessionHandle,
        path: &ObjectPath,
        znode: &ZnodePath,
    ) -> Result<()> {
        let result = self
            .idempotent(session, |s| async move { s.create(znode, &[]).await })
            .await?;
        match result {
            Ok(()) | Err(NativeCode::NodeExists) => Ok(()),
            Err(code) => Err(fail(code, path, session)),
        }
    }

    async fn create_parents(&self, session: &SessionHandle, path: &ObjectPath) -> Result<()> {
        let mut ancestors = Vec::new();
        let mut current = path.parent();
        while let Some(dir) = current.filter(|dir| !dir.is_root()) {
            current = dir.parent();
            ancestors.push(dir);
        }
        // Outermost first.
        for ancestor in ancestors.iter().rev() {
            let znode = self.inner.mapper.to_znode(ancestor)?;
            self.create_if_absent(session, ancestor, &znode).await?;
        }
        Ok(())
    }

    fn child(&self, parent: &ObjectPath, name: &str) -> Option<(ObjectPath, ZnodePath)> {
        let child = parent.child(name).ok()?;
        match self.inner.mapper.to_znode(&child) {
            Ok(znode) => Some((child, znode)),
            Err(e) => {
                debug!(name, error = %e, "skipping child");
                None
            }
        }
    }

    async fn child_names(
        &self,
        session: &SessionHandle,
        path: &ObjectPath,
        znode: &ZnodePath,
    ) -> Result<Vec<String>> {
        let result = self
            .idempotent(session, |s| async move { s.children(znode).await })
            .await?;
        let mut names = result.map_err(|code| fail(code, path, session))?;
        names.retain(|name| self.child(path, name).is_some());
        names.sort();
        Ok(names)
    }

    async fn stat_children(
        &self,
        session: &SessionHandle,
        parent: &ObjectPath,
        names: Vec<String>,
    ) -> Result<Vec<Entry>> {
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let Some((child, child_znode)) = self.child(parent, &name) else {
                continue;
            };
            let child_znode = &child_znode;
            let result = self
                .idempotent(session, |s| async move { s.stat(child_znode).await })
                .await?;
            match result {
                Ok(Some(stat)) => entries.push(Entry::from_stat(child, &stat)),
                // Removed between enumeration and stat.
                Ok(None) | Err(NativeCode::NoNode) => {}
                Err(code) => return Err(fail(code, &child, session)),
            }
        }
        Ok(entries)
    }
}

fn not_found(path: &ObjectPath) -> StoreError {
    StoreError::NotFound {
        path: path.to_string(),
    }
}

fn fail(code: NativeCode, path: &ObjectPath, session: &SessionHandle) -> StoreError {
    StoreError::from_native(code, &path.to_string(), session.id())
}
