//! In-memory ensemble for tests.
//!
//! [`MemoryEnsemble`] keeps a znode tree in process and implements
//! [`Connector`], so a [`crate::ZkStore`] can run against it unchanged. It
//! models the parts of ZooKeeper behaviour the adapter depends on: persistent
//! znodes with versions, quorum loss when a majority of members is down,
//! transient disconnects the client recovers from within the same session,
//! leader changes that drop every connection, session expiry, and calls whose
//! outcome is unknown to the caller.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::ensemble::{
    ConnectSettings, Connection, Connector, Established, NativeCode, SessionEvent, ZnodeStat,
    MAX_REQUEST_LEN,
};

/// Default per-znode data limit, matching ZooKeeper's `jute.maxbuffer`.
pub const SIM_MAX_DATA_LEN: usize = MAX_REQUEST_LEN;

/// Which call an injected fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// Any call.
    Any,
    /// `get_data`.
    GetData,
    /// `set_data`.
    SetData,
    /// `create`.
    Create,
    /// `delete`.
    Delete,
    /// `stat`.
    Stat,
    /// `children`.
    Children,
}

/// A one-shot failure for the next matching call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimFault {
    /// Fail with `code` without touching the tree.
    Fail(NativeCode),
    /// Apply the call, then report `ConnectionLoss` to the caller.
    ApplyThenLose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

#[derive(Debug)]
struct SimSession {
    id: u64,
    link: Mutex<Link>,
    member: Mutex<String>,
    // Bumped whenever the TCP connection underneath the session is replaced;
    // calls sent on an older connection come back with `ConnectionLoss`.
    epoch: AtomicU64,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SimSession {
    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn link(&self) -> Link {
        *self.link.lock()
    }

    fn set_link(&self, link: Link) {
        *self.link.lock() = link;
    }
}

#[derive(Debug, Clone)]
struct Znode {
    data: Vec<u8>,
    version: i32,
    ctime: i64,
    mtime: i64,
}

#[derive(Debug, Clone)]
struct Member {
    name: String,
    up: bool,
}

#[derive(Debug)]
struct State {
    tree: BTreeMap<String, Znode>,
    members: Vec<Member>,
    leader: usize,
    sessions: Vec<Arc<SimSession>>,
    next_session: u64,
    latency: Duration,
    faults: VecDeque<(SimOp, SimFault)>,
    max_data_len: usize,
}

impl State {
    fn has_quorum(&self) -> bool {
        let up = self.members.iter().filter(|m| m.up).count();
        up * 2 > self.members.len()
    }

    fn first_up_member(&self) -> Option<usize> {
        let n = self.members.len();
        (0..n)
            .map(|offset| (self.leader + offset) % n)
            .find(|idx| self.members[*idx].up)
    }

    fn live_sessions(&self) -> impl Iterator<Item = &Arc<SimSession>> {
        self.sessions
            .iter()
            .filter(|s| matches!(s.link(), Link::Connected | Link::Disconnected))
    }

    fn prune(&mut self) {
        self.sessions
            .retain(|s| matches!(s.link(), Link::Connected | Link::Disconnected));
    }

    fn take_fault(&mut self, op: SimOp) -> Option<SimFault> {
        let pos = self
            .faults
            .iter()
            .position(|(target, _)| *target == SimOp::Any || *target == op)?;
        self.faults.remove(pos).map(|(_, fault)| fault)
    }

    fn child_names(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        self.tree
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .filter_map(|(key, _)| {
                let rest = &key[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn stat_of(&self, path: &str) -> Option<ZnodeStat> {
        let node = self.tree.get(path)?;
        Some(ZnodeStat {
            version: node.version,
            data_length: node.data.len() as i32,
            num_children: self.child_names(path).len() as i32,
            ctime: node.ctime,
            mtime: node.mtime,
        })
    }

    fn apply(&mut self, request: &Request<'_>) -> Result<Reply, NativeCode> {
        let now = chrono::Utc::now().timestamp_millis();
        match *request {
            Request::GetData(path) => {
                let node = self.tree.get(path).ok_or(NativeCode::NoNode)?;
                let data = node.data.clone();
                let stat = self.stat_of(path).ok_or(NativeCode::NoNode)?;
                Ok(Reply::Data(data, stat))
            }
            Request::SetData(path, data) => {
                if data.len() > self.max_data_len {
                    return Err(NativeCode::Other(
                        "packet length exceeds jute.maxbuffer".into(),
                    ));
                }
                let node = self.tree.get_mut(path).ok_or(NativeCode::NoNode)?;
                node.data = data.to_vec();
                node.version += 1;
                node.mtime = now;
                let stat = self.stat_of(path).ok_or(NativeCode::NoNode)?;
                Ok(Reply::Stat(stat))
            }
            Request::Create(path, data) => {
                if data.len() > self.max_data_len {
                    return Err(NativeCode::Other(
                        "packet length exceeds jute.maxbuffer".into(),
                    ));
                }
                if self.tree.contains_key(path) {
                    return Err(NativeCode::NodeExists);
                }
                let parent = match path.rfind('/') {
                    Some(0) => "/",
                    Some(idx) => &path[..idx],
                    None => {
                        return Err(NativeCode::Other(format!("path must be absolute: {}", path)))
                    }
                };
                if !self.tree.contains_key(parent) {
                    return Err(NativeCode::NoNode);
                }
                self.tree.insert(
                    path.to_string(),
                    Znode {
                        data: data.to_vec(),
                        version: 0,
                        ctime: now,
                        mtime: now,
                    },
                );
                Ok(Reply::Done)
            }
            Request::Delete(path) => {
                if path == "/" || path == "/zookeeper" {
                    return Err(NativeCode::Other(format!("cannot delete {}", path)));
                }
                if !self.tree.contains_key(path) {
                    return Err(NativeCode::NoNode);
                }
                if !self.child_names(path).is_empty() {
                    return Err(NativeCode::NotEmpty);
                }
                self.tree.remove(path);
                Ok(Reply::Done)
            }
            Request::Stat(path) => Ok(Reply::MaybeStat(self.stat_of(path))),
            Request::Children(path) => {
                if !self.tree.contains_key(path) {
                    return Err(NativeCode::NoNode);
                }
                Ok(Reply::Names(self.child_names(path)))
            }
        }
    }
}

enum Request<'a> {
    GetData(&'a str),
    SetData(&'a str, &'a [u8]),
    Create(&'a str, &'a [u8]),
    Delete(&'a str),
    Stat(&'a str),
    Children(&'a str),
}

impl Request<'_> {
    fn op(&self) -> SimOp {
        match self {
            Request::GetData(_) => SimOp::GetData,
            Request::SetData(..) => SimOp::SetData,
            Request::Create(..) => SimOp::Create,
            Request::Delete(_) => SimOp::Delete,
            Request::Stat(_) => SimOp::Stat,
            Request::Children(_) => SimOp::Children,
        }
    }
}

enum Reply {
    Data(Vec<u8>, ZnodeStat),
    Stat(ZnodeStat),
    MaybeStat(Option<ZnodeStat>),
    Names(Vec<String>),
    Done,
}

/// An in-process ensemble of one or more members.
#[derive(Debug, Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<State>>,
}

impl MemoryEnsemble {
    /// Ensemble with `members` servers, all up, member 0 leading.
    pub fn cluster(members: usize) -> Self {
        let members = members.max(1);
        let now = chrono::Utc::now().timestamp_millis();
        let mut tree = BTreeMap::new();
        for path in ["/", "/zookeeper"] {
            tree.insert(
                path.to_string(),
                Znode {
                    data: Vec::new(),
                    version: 0,
                    ctime: now,
                    mtime: now,
                },
            );
        }
        Self {
            state: Arc::new(Mutex::new(State {
                tree,
                members: (0..members)
                    .map(|i| Member {
                        name: format!("sim-{}:2181", i),
                        up: true,
                    })
                    .collect(),
                leader: 0,
                sessions: Vec::new(),
                next_session: 0,
                latency: Duration::ZERO,
                faults: VecDeque::new(),
                max_data_len: SIM_MAX_DATA_LEN,
            })),
        }
    }

    /// A one-server ensemble.
    pub fn single_node() -> Self {
        Self::cluster(1)
    }

    /// A three-server quorum.
    pub fn three_node() -> Self {
        Self::cluster(3)
    }

    /// Member names in order.
    pub fn members(&self) -> Vec<String> {
        self.state.lock().members.iter().map(|m| m.name.clone()).collect()
    }

    /// Name of the current leader, if a quorum exists.
    pub fn leader(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .has_quorum()
            .then(|| state.members[state.leader].name.clone())
    }

    /// True while a majority of members is up.
    pub fn has_quorum(&self) -> bool {
        self.state.lock().has_quorum()
    }

    /// Sessions that are connected or recovering.
    pub fn live_session_count(&self) -> usize {
        self.state.lock().live_sessions().count()
    }

    /// Delay applied to every call before it reaches the tree.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = latency;
    }

    /// Overrides the server-side data limit.
    pub fn set_max_data_len(&self, len: usize) {
        self.state.lock().max_data_len = len;
    }

    /// Queues a one-shot fault for the next call matching `op`.
    pub fn inject(&self, op: SimOp, fault: SimFault) {
        self.state.lock().faults.push_back((op, fault));
    }

    /// Drops all queued faults.
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Raw znode data, bypassing sessions.
    pub fn peek(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().tree.get(path).map(|n| n.data.clone())
    }

    /// Whether the znode exists, bypassing sessions.
    pub fn contains(&self, path: &str) -> bool {
        self.state.lock().tree.contains_key(path)
    }

    /// Every live connection drops; clients keep their sessions.
    pub fn disconnect_all(&self) {
        let state = self.state.lock();
        for session in state.live_sessions() {
            session.epoch.fetch_add(1, Ordering::AcqRel);
            if session.link() == Link::Connected {
                session.set_link(Link::Disconnected);
                session.notify(SessionEvent::Disconnected);
            }
        }
    }

    /// Disconnected clients resume their sessions, if a quorum exists.
    pub fn reconnect_all(&self) {
        let state = self.state.lock();
        let Some(target) = state.first_up_member() else {
            return;
        };
        if !state.has_quorum() {
            return;
        }
        let name = state.members[target].name.clone();
        for session in state.live_sessions() {
            if session.link() == Link::Disconnected {
                *session.member.lock() = name.clone();
                session.set_link(Link::Connected);
                session.notify(SessionEvent::Reconnected { read_only: false });
            }
        }
    }

    /// The server expires every session.
    pub fn expire_sessions(&self) {
        let mut state = self.state.lock();
        for session in state.live_sessions() {
            session.epoch.fetch_add(1, Ordering::AcqRel);
            session.set_link(Link::Expired);
            session.notify(SessionEvent::Expired);
        }
        state.prune();
    }

    /// Moves leadership to the next live member. Every client connection is
    /// dropped and re-established within the same session, as followers close
    /// connections while the quorum re-forms.
    pub fn leader_change(&self) {
        {
            let mut state = self.state.lock();
            let n = state.members.len();
            let leader = state.leader;
            let next = (1..=n)
                .map(|offset| (leader + offset) % n)
                .find(|idx| state.members[*idx].up);
            if let Some(next) = next {
                state.leader = next;
            }
        }
        self.disconnect_all();
        self.reconnect_all();
    }

    /// Stops a member. Clients attached to it fail over to another member
    /// while a quorum remains; without quorum every client is disconnected.
    pub fn crash_member(&self, idx: usize) {
        let lost_quorum;
        {
            let mut state = self.state.lock();
            let Some(member) = state.members.get_mut(idx) else {
                return;
            };
            member.up = false;
            let name = member.name.clone();
            lost_quorum = !state.has_quorum();
            if !lost_quorum {
                let leader_down = state.leader == idx;
                if leader_down {
                    if let Some(next) = state.first_up_member() {
                        state.leader = next;
                    }
                }
                let target = state.first_up_member().map(|i| state.members[i].name.clone());
                for session in state.live_sessions() {
                    let attached = *session.member.lock() == name;
                    if (attached || leader_down) && session.link() == Link::Connected {
                        session.epoch.fetch_add(1, Ordering::AcqRel);
                        session.notify(SessionEvent::Disconnected);
                        if let Some(target) = &target {
                            *session.member.lock() = target.clone();
                        }
                        session.notify(SessionEvent::Reconnected { read_only: false });
                    }
                }
            }
        }
        if lost_quorum {
            self.disconnect_all();
        }
    }

    /// Restarts a member; regaining quorum lets clients resume.
    pub fn restart_member(&self, idx: usize) {
        {
            let mut state = self.state.lock();
            if let Some(member) = state.members.get_mut(idx) {
                member.up = true;
            }
            if !state.members[state.leader].up {
                if let Some(next) = state.first_up_member() {
                    state.leader = next;
                }
            }
        }
        self.reconnect_all();
    }

    async fn execute(
        &self,
        session: &SimSession,
        request: Request<'_>,
    ) -> Result<Reply, NativeCode> {
        let (latency, epoch) = {
            let state = self.state.lock();
            gate(&state, session)?;
            (state.latency, session.epoch.load(Ordering::Acquire))
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        gate(&state, session)?;
        if session.epoch.load(Ordering::Acquire) != epoch {
            return Err(NativeCode::ConnectionLoss);
        }
        match state.take_fault(request.op()) {
            Some(SimFault::Fail(code)) => Err(code),
            Some(SimFault::ApplyThenLose) => {
                let _ = state.apply(&request);
                Err(NativeCode::ConnectionLoss)
            }
            None => state.apply(&request),
        }
    }
}

fn gate(state: &State, session: &SimSession) -> Result<(), NativeCode> {
    match session.link() {
        Link::Connected if state.has_quorum() => Ok(()),
        Link::Connected | Link::Disconnected => Err(NativeCode::ConnectionLoss),
        Link::Expired => Err(NativeCode::SessionExpired),
        Link::Closed => Err(NativeCode::ClientClosed),
    }
}

#[async_trait]
impl Connector for MemoryEnsemble {
    async fn connect(&self, _settings: &ConnectSettings) -> Result<Established, NativeCode> {
        let mut state = self.state.lock();
        if !state.has_quorum() {
            return Err(NativeCode::ConnectionLoss);
        }
        let member = state
            .first_up_member()
            .map(|idx| state.members[idx].name.clone())
            .ok_or(NativeCode::ConnectionLoss)?;
        state.prune();
        state.next_session += 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(SimSession {
            id: state.next_session,
            link: Mutex::new(Link::Connected),
            member: Mutex::new(member),
            epoch: AtomicU64::new(0),
            events: tx,
        });
        state.sessions.push(Arc::clone(&session));
        Ok(Established {
            connection: Arc::new(SimConnection {
                ensemble: self.clone(),
                session,
            }),
            events: rx,
        })
    }
}

/// A client connection to a [`MemoryEnsemble`].
#[derive(Debug)]
pub struct SimConnection {
    ensemble: MemoryEnsemble,
    session: Arc<SimSession>,
}

impl SimConnection {
    /// Server-side session id.
    pub fn session_id(&self) -> u64 {
        self.session.id
    }
}

impl Drop for SimConnection {
    fn drop(&mut self) {
        let mut link = self.session.link.lock();
        if matches!(*link, Link::Connected | Link::Disconnected) {
            *link = Link::Closed;
        }
    }
}

fn unexpected_reply() -> NativeCode {
    NativeCode::Other("mismatched reply".to_string())
}

#[async_trait]
impl Connection for SimConnection {
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, ZnodeStat), NativeCode> {
        match self.ensemble.execute(&self.session, Request::GetData(path)).await? {
            Reply::Data(data, stat) => Ok((data, stat)),
            _ => Err(unexpected_reply()),
        }
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<ZnodeStat, NativeCode> {
        match self.ensemble.execute(&self.session, Request::SetData(path, data)).await? {
            Reply::Stat(stat) => Ok(stat),
            _ => Err(unexpected_reply()),
        }
    }

    async fn create(&self, path: &str, data: &[u8]) -> Result<(), NativeCode> {
        match self.ensemble.execute(&self.session, Request::Create(path, data)).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected_reply()),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), NativeCode> {
        match self.ensemble.execute(&self.session, Request::Delete(path)).await? {
            Reply::Done => Ok(()),
            _ => Err(unexpected_reply()),
        }
    }

    async fn stat(&self, path: &str) -> Result<Option<ZnodeStat>, NativeCode> {
        match self.ensemble.execute(&self.session, Request::Stat(path)).await? {
            Reply::MaybeStat(stat) => Ok(stat),
            _ => Err(unexpected_reply()),
        }
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, NativeCode> {
        match self.ensemble.execute(&self.session, Request::Children(path)).await? {
            Reply::Names(names) => Ok(names),
            _ => Err(unexpected_reply()),
        }
    }

    fn member(&self) -> Option<String> {
        Some(self.session.member.lock().clone())
    }
}
