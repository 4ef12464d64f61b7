//! Fault injection against a simulated ensemble.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::info;
use zkstore_core::{MemoryEnsemble, SimFault, SimOp};

/// Why a fault could not be injected.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChaosError {
    /// The member index does not exist.
    #[error("no member {index} in a {size}-member ensemble")]
    InvalidMember {
        /// Requested member.
        index: usize,
        /// Ensemble size.
        size: usize,
    },
    /// The member is already down.
    #[error("member {0} is already crashed")]
    AlreadyCrashed(usize),
}

/// A fault the injector knows how to apply.
#[derive(Debug, Clone, PartialEq)]
pub enum FaultType {
    /// Leadership moves; every client connection drops and resumes.
    LeaderChange,
    /// The ensemble expires every session.
    SessionExpiry,
    /// A member stops until the fault is cleared.
    MemberCrash(usize),
    /// All client connections drop until the fault is cleared.
    Disconnect,
    /// The next set is applied but reported to the client as lost.
    AmbiguousWrite,
    /// Every call is delayed until the fault is cleared.
    Latency {
        /// Added delay per call.
        delay_ms: u64,
    },
}

impl FaultType {
    /// Human-readable description.
    pub fn description(&self) -> String {
        match self {
            FaultType::LeaderChange => "leader change".to_string(),
            FaultType::SessionExpiry => "session expiry".to_string(),
            FaultType::MemberCrash(member) => format!("member {} crash", member),
            FaultType::Disconnect => "client disconnect".to_string(),
            FaultType::AmbiguousWrite => "ambiguous write".to_string(),
            FaultType::Latency { delay_ms } => format!("latency {}ms", delay_ms),
        }
    }

    /// Faults that clear themselves once applied.
    pub fn is_instant(&self) -> bool {
        matches!(self, FaultType::LeaderChange | FaultType::SessionExpiry)
    }

    /// A random fault for an ensemble of `members`. Member crashes are only
    /// picked when one member can go down without losing quorum.
    pub fn random(rng: &mut impl Rng, members: usize) -> Self {
        match rng.gen_range(0..5) {
            0 => FaultType::LeaderChange,
            1 => FaultType::SessionExpiry,
            2 if members >= 3 => FaultType::MemberCrash(rng.gen_range(0..members)),
            3 => FaultType::AmbiguousWrite,
            _ => FaultType::Latency {
                delay_ms: rng.gen_range(1..5),
            },
        }
    }
}

/// Opaque handle to clear a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultHandle(u64);

/// Applies faults to a [`MemoryEnsemble`] and undoes them.
#[derive(Debug)]
pub struct FaultInjector {
    ensemble: MemoryEnsemble,
    active: HashMap<FaultHandle, FaultType>,
    next_handle: u64,
    injected: Vec<FaultType>,
}

impl FaultInjector {
    /// Injector for `ensemble`.
    pub fn new(ensemble: MemoryEnsemble) -> Self {
        Self {
            ensemble,
            active: HashMap::new(),
            next_handle: 0,
            injected: Vec::new(),
        }
    }

    /// Applies a fault. Instant faults take effect immediately and are not
    /// tracked as active.
    pub fn inject(&mut self, fault: FaultType) -> Result<FaultHandle, ChaosError> {
        match &fault {
            FaultType::LeaderChange => self.ensemble.leader_change(),
            FaultType::SessionExpiry => self.ensemble.expire_sessions(),
            FaultType::MemberCrash(index) => {
                let size = self.ensemble.members().len();
                if *index >= size {
                    return Err(ChaosError::InvalidMember {
                        index: *index,
                        size,
                    });
                }
                if self.has_fault(&fault) {
                    return Err(ChaosError::AlreadyCrashed(*index));
                }
                self.ensemble.crash_member(*index);
            }
            FaultType::Disconnect => self.ensemble.disconnect_all(),
            FaultType::AmbiguousWrite => self
                .ensemble
                .inject(SimOp::SetData, SimFault::ApplyThenLose),
            FaultType::Latency { delay_ms } => self
                .ensemble
                .set_latency(Duration::from_millis(*delay_ms)),
        }
        info!(fault = %fault.description(), "injected");

        let handle = FaultHandle(self.next_handle);
        self.next_handle += 1;
        self.injected.push(fault.clone());
        if !fault.is_instant() {
            self.active.insert(handle, fault);
        }
        Ok(handle)
    }

    /// Undoes a fault.
    pub fn clear(&mut self, handle: FaultHandle) {
        let Some(fault) = self.active.remove(&handle) else {
            return;
        };
        match fault {
            FaultType::MemberCrash(index) => self.ensemble.restart_member(index),
            FaultType::Disconnect => self.ensemble.reconnect_all(),
            FaultType::AmbiguousWrite => self.ensemble.clear_faults(),
            FaultType::Latency { .. } => self.ensemble.set_latency(Duration::ZERO),
            FaultType::LeaderChange | FaultType::SessionExpiry => {}
        }
        info!(fault = %fault.description(), "cleared");
    }

    /// Undoes every active fault.
    pub fn clear_all(&mut self) {
        let handles: Vec<FaultHandle> = self.active.keys().copied().collect();
        for handle in handles {
            self.clear(handle);
        }
    }

    /// Faults currently in effect.
    pub fn active_faults(&self) -> usize {
        self.active.len()
    }

    /// Whether `fault` is currently in effect.
    pub fn has_fault(&self, fault: &FaultType) -> bool {
        self.active.values().any(|f| f == fault)
    }

    /// Every fault injected so far, in order.
    pub fn injected(&self) -> &[FaultType] {
        &self.injected
    }

    /// The ensemble under test.
    pub fn ensemble(&self) -> &MemoryEnsemble {
        &self.ensemble
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_crash_and_restart() {
        let ensemble = MemoryEnsemble::three_node();
        let mut injector = FaultInjector::new(ensemble.clone());

        let handle = injector.inject(FaultType::MemberCrash(1)).unwrap();
        assert_eq!(injector.active_faults(), 1);
        assert_eq!(
            injector.inject(FaultType::MemberCrash(1)),
            Err(ChaosError::AlreadyCrashed(1))
        );
        assert!(ensemble.has_quorum());

        let second = injector.inject(FaultType::MemberCrash(2)).unwrap();
        assert!(!ensemble.has_quorum());

        injector.clear(second);
        assert!(ensemble.has_quorum());
        injector.clear(handle);
        assert_eq!(injector.active_faults(), 0);
    }

    #[test]
    fn test_invalid_member() {
        let mut injector = FaultInjector::new(MemoryEnsemble::single_node());
        assert_eq!(
            injector.inject(FaultType::MemberCrash(3)),
            Err(ChaosError::InvalidMember { index: 3, size: 1 })
        );
        assert!(injector.injected().is_empty());
    }

    #[test]
    fn test_instant_faults_are_not_active() {
        let ensemble = MemoryEnsemble::three_node();
        let mut injector = FaultInjector::new(ensemble.clone());
        injector.inject(FaultType::LeaderChange).unwrap();
        injector.inject(FaultType::SessionExpiry).unwrap();
        assert_eq!(injector.active_faults(), 0);
        assert_eq!(injector.injected().len(), 2);
        assert_eq!(ensemble.leader().as_deref(), Some("sim-1:2181"));
    }

    #[test]
    fn test_clear_all() {
        let mut injector = FaultInjector::new(MemoryEnsemble::three_node());
        injector.inject(FaultType::Disconnect).unwrap();
        injector.inject(FaultType::Latency { delay_ms: 5 }).unwrap();
        injector.inject(FaultType::MemberCrash(0)).unwrap();
        assert_eq!(injector.active_faults(), 3);
        injector.clear_all();
        assert_eq!(injector.active_faults(), 0);
        assert!(injector.ensemble().has_quorum());
    }

    #[test]
    fn test_random_faults_keep_quorum_in_single_node() {
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let fault = FaultType::random(&mut rng, 1);
            assert!(!matches!(fault, FaultType::MemberCrash(_)));
        }
    }

    #[test]
    fn test_descriptions() {
        assert_eq!(FaultType::MemberCrash(2).description(), "member 2 crash");
        assert_eq!(
            FaultType::Latency { delay_ms: 3 }.description(),
            "latency 3ms"
        );
    }
}
