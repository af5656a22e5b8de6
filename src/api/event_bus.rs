use crate::commitlog::{LogIndex, Term};
use crate::replica::cluster_config::ServerId;

/// Named engine events delivered to the application's hook. Several may fire
/// for one underlying action, possibly on different worker threads; only
/// set-membership of fired events is guaranteed, not order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HookEvent {
    BecomeFollower { term: Term },
    BecomeLeader { term: Term },
    /// Entries were appended to the local log (leader write path).
    AppendLogs { first_index: LogIndex, count: usize },
    /// A 2-node cluster is about to shrink its quorums to 1. Vetoable.
    AutoAdjustQuorum,
    /// This server saw its own removal commit (or a quorum declared it
    /// abandoned). Two-step shutdown follows.
    RemovedFromCluster,
    /// A configuration entry took effect in memory.
    NewConfig { log_index: LogIndex },
    /// The engine requested a state-machine snapshot.
    SaveSnapshot { last_index: LogIndex },
}

/// `ReturnNull` vetoes the associated action where the action is vetoable
/// (today: `AutoAdjustQuorum`); elsewhere it is recorded and ignored.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum HookDecision {
    Ok,
    ReturnNull,
}

/// Application hook surface. All methods have benign defaults.
///
/// The meta hooks implement per-message application metadata: the write side
/// may attach an opaque string to any outbound request, and the read side
/// validates it before the engine touches the message. Returning `false`
/// from `verify_request_meta` drops the message.
pub trait EventHooks: Send + Sync + 'static {
    fn on_event(&self, _event: HookEvent) -> HookDecision {
        HookDecision::Ok
    }

    fn write_request_meta(&self, _dst: ServerId, _kind: &'static str) -> Option<String> {
        None
    }

    fn verify_request_meta(&self, _src: ServerId, _kind: &'static str, _meta: Option<&str>) -> bool {
        true
    }
}

/// Default hook: accepts everything, attaches nothing.
pub struct NoOpHooks;

impl EventHooks for NoOpHooks {}
