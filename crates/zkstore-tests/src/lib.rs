//! zkstore failover harness
//!
//! Fixtures that stand up a store against a simulated or live ensemble, fault
//! injection for the simulated one, a checker for concurrent write histories
//! and the behavior suite every backend has to pass.

pub mod chaos;
pub mod harness;
pub mod history;
pub mod suite;

pub use chaos::{ChaosError, FaultHandle, FaultInjector, FaultType};
pub use harness::{init_tracing, live_enabled, unique_root, with_retries, Backend, EnsembleFixture};
pub use history::{HistoryReport, Violation, WriteHistory, WriteId, WriteOutcome};
pub use suite::{run_behavior_suite, SuiteReport};
