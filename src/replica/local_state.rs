use crate::commitlog::Term;
use crate::replica::cluster_config::{ClusterConfig, ServerId};
use std::sync::{Arc, Mutex};

/// The durable `(current_term, voted_for)` record. It must reach stable
/// storage before any vote grant or term bump becomes externally visible.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PersistentState {
    pub term: Term,
    pub voted_for: ServerId,
}

impl PersistentState {
    pub fn initial() -> Self {
        PersistentState {
            term: Term::ZERO,
            voted_for: ServerId::NONE,
        }
    }
}

/// Process exit codes surfaced through `StateManager::system_exit`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExitCode {
    /// Pre-vote kept failing on busy connections past the configured limit;
    /// this server cannot reach the rest of the group.
    UnrecoverableIsolation,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        match self {
            // Historical code carried over from the wire protocol family.
            ExitCode::UnrecoverableIsolation => 22,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateManagerError {
    #[error("failed to persist server state: {0}")]
    Io(#[from] std::io::Error),
}

/// StateManager owns durable server state and the initial/latest cluster
/// configuration. It is also the escape hatch the engine uses to terminate
/// the process on unrecoverable conditions.
pub trait StateManager: Send + 'static {
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StateManagerError>;
    fn load_state(&self) -> Result<Option<PersistentState>, StateManagerError>;
    fn save_config(&mut self, config: &ClusterConfig) -> Result<(), StateManagerError>;
    fn load_config(&self) -> Result<Option<ClusterConfig>, StateManagerError>;
    fn system_exit(&mut self, code: ExitCode);
}

/// In-memory state manager. State survives replica restarts that reuse the
/// same instance (tests do exactly that); `system_exit` records the code
/// instead of killing the process so tests can observe it.
#[derive(Clone)]
pub struct InMemoryStateManager {
    inner: Arc<Mutex<StateManagerInner>>,
}

struct StateManagerInner {
    state: Option<PersistentState>,
    config: Option<ClusterConfig>,
    exit_code: Option<ExitCode>,
}

impl InMemoryStateManager {
    pub fn new(initial_config: ClusterConfig) -> Self {
        InMemoryStateManager {
            inner: Arc::new(Mutex::new(StateManagerInner {
                state: None,
                config: Some(initial_config),
                exit_code: None,
            })),
        }
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        self.inner.lock().expect("state manager lock").exit_code
    }
}

impl StateManager for InMemoryStateManager {
    fn save_state(&mut self, state: &PersistentState) -> Result<(), StateManagerError> {
        self.inner.lock().expect("state manager lock").state = Some(state.clone());
        Ok(())
    }

    fn load_state(&self) -> Result<Option<PersistentState>, StateManagerError> {
        Ok(self.inner.lock().expect("state manager lock").state.clone())
    }

    fn save_config(&mut self, config: &ClusterConfig) -> Result<(), StateManagerError> {
        self.inner.lock().expect("state manager lock").config = Some(config.clone());
        Ok(())
    }

    fn load_config(&self) -> Result<Option<ClusterConfig>, StateManagerError> {
        Ok(self.inner.lock().expect("state manager lock").config.clone())
    }

    fn system_exit(&mut self, code: ExitCode) {
        self.inner.lock().expect("state manager lock").exit_code = Some(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::cluster_config::ServerDescriptor;

    #[test]
    fn state_survives_reload() {
        let config = ClusterConfig::new(vec![ServerDescriptor::new(ServerId::new(1), "a:1", 1)]);
        let mut mgr = InMemoryStateManager::new(config.clone());

        assert_eq!(mgr.load_state().unwrap(), None);
        let state = PersistentState {
            term: Term::new(4),
            voted_for: ServerId::new(2),
        };
        mgr.save_state(&state).unwrap();

        let observer = mgr.clone();
        assert_eq!(observer.load_state().unwrap(), Some(state));
        assert_eq!(observer.load_config().unwrap(), Some(config));
        assert_eq!(observer.exit_code(), None);

        mgr.system_exit(ExitCode::UnrecoverableIsolation);
        assert_eq!(observer.exit_code(), Some(ExitCode::UnrecoverableIsolation));
    }
}
