#![warn(missing_docs)]

//! zkstore core: an object storage adapter over a ZooKeeper ensemble.
//!
//! Objects live in persistent znodes below a configurable root. Directories
//! are implicit and materialised as empty marker znodes. A single session is
//! shared by all operations and re-established when it expires.

pub mod backoff;
pub mod cli;
pub mod config;
pub mod ensemble;
pub mod error;
pub mod health;
pub mod path;
pub mod session;
pub mod sim;
pub mod store;
pub mod zk;

pub use backoff::{Backoff, ReconnectConfig};
pub use config::StoreConfig;
pub use ensemble::{Connection, Connector, NativeCode, SessionEvent, ZnodeStat};
pub use error::{ConnectionError, Result, StoreError};
pub use health::{CallHealth, HealthStats, HealthStatus};
pub use path::{ObjectPath, PathMapper, ZnodePath};
pub use session::{
    CallResult, SessionHandle, SessionManager, SessionState, SessionStats, SessionStatus,
};
pub use sim::{MemoryEnsemble, SimFault, SimOp};
pub use store::{Entry, ListPage, ZkStore};
pub use zk::ZkConnector;
