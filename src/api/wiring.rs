use crate::actor::{ActorClient, ReplicaActor};
use crate::api::client::RaftMember;
use crate::api::event_bus::{EventHooks, NoOpHooks};
use crate::api::options::{InvalidOptions, RaftOptions};
use crate::commitlog::LogStore;
use crate::replica::{
    RaftRequest, RaftResponse, Replica, ReplicaConfig, RequestError, ServerId, SharedStatus, StateManager,
    StateMachine,
};
use crate::transport::{RpcError, RpcHandler, Transport};
use std::sync::{Arc, Mutex};

/// Everything needed to bring a member up. The log store, state manager,
/// state machine, and transport are the external collaborators; the engine
/// only ever talks to them through their contracts.
pub struct RaftMemberConfig {
    pub my_id: ServerId,
    pub logger: slog::Logger,
    pub options: RaftOptions,
    /// Start in catching-up mode (freshly added server that has not yet
    /// been finalized into the configuration).
    pub catching_up: bool,
    pub hooks: Option<Arc<dyn EventHooks>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemberStartError {
    #[error("invalid options: {0}")]
    InvalidOptions(#[from] InvalidOptions),
}

/// Wire up and launch a replica: apply pipeline, coordination task, timers.
/// Must be called from within a tokio runtime. The returned handle's
/// `rpc_handler()` is the inbound entry point to register with the
/// transport.
pub fn start_member<L, S>(
    config: RaftMemberConfig,
    log: L,
    state_manager: S,
    state_machine: Arc<Mutex<dyn StateMachine>>,
    transport: Arc<dyn Transport>,
) -> Result<RaftMember, MemberStartError>
where
    L: LogStore,
    S: StateManager,
{
    config.options.validate()?;

    let logger = config.logger.new(slog::o!("server_id" => config.my_id.as_i32()));
    let status = SharedStatus::new(config.my_id);
    let (actor_client, actor_queue_rx) = ActorClient::channel(64);
    let hooks = config.hooks.unwrap_or_else(|| Arc::new(NoOpHooks));

    let replica = Replica::new(ReplicaConfig {
        logger: logger.clone(),
        my_id: config.my_id,
        options: config.options.clone(),
        hooks,
        log,
        state_manager,
        state_machine,
        transport,
        catching_up: config.catching_up,
        actor_client: actor_client.clone(),
        status: Arc::clone(&status),
    });

    let actor = ReplicaActor::new(logger, actor_queue_rx, replica);
    tokio::task::spawn(actor.run_event_loop());

    let rpc_handler: Arc<dyn RpcHandler> = Arc::new(MemberRpcHandler {
        actor_client: actor_client.clone(),
    });

    Ok(RaftMember::new(actor_client, status, rpc_handler, &config.options))
}

/// Adapts the transport's server side onto the coordination task's single
/// inbound entry point.
struct MemberRpcHandler {
    actor_client: ActorClient,
}

#[async_trait::async_trait]
impl RpcHandler for MemberRpcHandler {
    async fn handle(&self, request: RaftRequest) -> Result<RaftResponse, RpcError> {
        self.actor_client.incoming_request(request).await.map_err(|error| match error {
            RequestError::MetaRejected => RpcError::Dropped("metadata rejected".to_string()),
            RequestError::ShuttingDown => RpcError::Dropped("replica shutting down".to_string()),
        })
    }
}
