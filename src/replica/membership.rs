//! Membership reconfiguration: one change at a time, configuration entries
//! take effect at append, and a freshly added server is caught up before the
//! finalizing entry makes it a full member. A removed server shuts itself
//! down in two steps once it sees its removal commit.

use crate::commitlog::{EntryKind, LogIndex, LogStore};
use crate::replica::cluster_config::{ClusterConfig, ServerDescriptor, ServerId};
use crate::replica::local_state::StateManager;
use crate::replica::messages::{CustomNotificationKind, CustomNotificationRequest, RaftRequest};
use crate::replica::replica::Replica;
use crate::replica::replica_api::{MembershipError, Role};
use std::sync::Arc;

/// The single reconfiguration allowed in flight.
#[derive(Debug)]
pub(super) enum ConfigChange {
    AddingServer {
        id: ServerId,
        /// Set once the finalizing entry is appended; its commit ends the
        /// change.
        finalize_index: Option<LogIndex>,
    },
    RemovingServer {
        id: ServerId,
        entry_index: LogIndex,
    },
}

impl<L, S> Replica<L, S>
where
    L: LogStore,
    S: StateManager,
{
    pub(crate) fn handle_add_server(&mut self, descriptor: ServerDescriptor) -> Result<(), MembershipError> {
        if self.shutting_down {
            return Err(MembershipError::ShuttingDown);
        }
        if self.role != Role::Leader {
            return Err(MembershipError::NotLeader {
                leader_hint: self.leader,
            });
        }
        if self.config_change.is_some() {
            return Err(MembershipError::ConfigChanging);
        }
        if self.config.contains(descriptor.id) {
            return Err(MembershipError::AlreadyMember(descriptor.id));
        }

        let mut descriptor = descriptor;
        descriptor.is_new_joiner = self.options.use_new_joiner_type;
        let new_id = descriptor.id;

        let mut servers = self.config.servers.clone();
        servers.push(descriptor);
        let new_config = ClusterConfig::new(servers);

        slog::info!(self.logger, "Adding server {} to the cluster", new_id);
        let _entry_index = self.append_config_entry(new_config)?;
        self.config_change = Some(ConfigChange::AddingServer {
            id: new_id,
            finalize_index: None,
        });

        // Catch-up starts right away.
        self.request_append_entries(new_id);
        Ok(())
    }

    pub(crate) fn handle_remove_server(&mut self, server_id: ServerId) -> Result<(), MembershipError> {
        if self.shutting_down {
            return Err(MembershipError::ShuttingDown);
        }
        if self.role != Role::Leader {
            return Err(MembershipError::NotLeader {
                leader_hint: self.leader,
            });
        }
        if self.config_change.is_some() {
            return Err(MembershipError::ConfigChanging);
        }
        if !self.config.contains(server_id) {
            return Err(MembershipError::NotAMember(server_id));
        }
        if server_id == self.my_id {
            return Err(MembershipError::CannotRemoveLeader);
        }

        let servers: Vec<ServerDescriptor> = self
            .config
            .servers
            .iter()
            .filter(|s| s.id != server_id)
            .cloned()
            .collect();
        let new_config = ClusterConfig::new(servers);

        slog::info!(self.logger, "Removing server {} from the cluster", server_id);
        let entry_index = self.append_config_entry(new_config)?;
        self.config_change = Some(ConfigChange::RemovingServer {
            id: server_id,
            entry_index,
        });
        Ok(())
    }

    /// Append a configuration entry and make it authoritative immediately.
    pub(super) fn append_config_entry(&mut self, mut config: ClusterConfig) -> Result<LogIndex, MembershipError> {
        config.log_index = self.log.next_slot();
        config.prev_log_index = self.config.log_index;
        let entry = config.to_log_entry(self.state.term);
        let index = self
            .log
            .append(entry)
            .map_err(|e| MembershipError::LocalIo(e.to_string()))?;
        self.status.set_last_log_index(index);
        self.apply_config(config);
        self.after_local_append(index);
        Ok(index)
    }

    /// A peer just acked; if it is the one being caught up and it is close
    /// enough to the log head, write the finalizing configuration entry.
    pub(super) fn maybe_finalize_join(&mut self, peer_id: ServerId) {
        let Some(ConfigChange::AddingServer {
            id,
            finalize_index: None,
        }) = &self.config_change
        else {
            return;
        };
        if *id != peer_id {
            return;
        }

        let matched = self
            .peers
            .get(peer_id)
            .map(|p| p.matched_index)
            .unwrap_or(LogIndex::ZERO);
        let last = self.last_log_index();
        if matched.as_u64() + self.options.log_sync_stop_gap < last.as_u64() {
            // Still catching up.
            return;
        }

        slog::info!(
            self.logger,
            "Server {} caught up (matched {}, last {}); finalizing membership",
            peer_id,
            matched,
            last
        );
        let mut servers = self.config.servers.clone();
        for server in &mut servers {
            if server.id == peer_id {
                server.is_new_joiner = false;
            }
        }
        match self.append_config_entry(ClusterConfig::new(servers)) {
            Ok(index) => {
                self.config_change = Some(ConfigChange::AddingServer {
                    id: peer_id,
                    finalize_index: Some(index),
                });
            }
            Err(error) => {
                slog::error!(self.logger, "Failed to append finalizing config entry: {}", error);
            }
        }
    }

    /// A configuration entry reached the commit index.
    pub(crate) fn handle_config_committed(&mut self, index: LogIndex) {
        let committed = match self.log.entry_at(index) {
            Ok(Some(entry)) if entry.kind == EntryKind::Configuration => {
                match ClusterConfig::from_bytes(entry.payload) {
                    Ok(config) => config,
                    Err(error) => {
                        slog::error!(self.logger, "Committed config at {} undecodable: {}", index, error);
                        return;
                    }
                }
            }
            _ => return,
        };
        self.committed_config = committed.clone();
        if let Err(error) = self.state_manager.save_config(&committed) {
            slog::warn!(self.logger, "Persisting committed config failed: {}", error);
        }

        // Seeing our own removal commit starts the staged shutdown, with
        // time for pending callbacks to drain.
        let me = self.committed_config.get_server(self.my_id);
        if me.is_none() && self.role != Role::Leader {
            slog::warn!(self.logger, "Committed configuration no longer contains this server");
            self.begin_removed_shutdown();
            return;
        }

        if self.role != Role::Leader {
            return;
        }

        match self.config_change.take() {
            Some(ConfigChange::AddingServer { id, finalize_index }) => match finalize_index {
                Some(fin) if fin == index => {
                    slog::info!(self.logger, "Membership of server {} finalized", id);
                    // Change complete.
                }
                _ => {
                    // First entry (or an unrelated config) committed; the
                    // catch-up phase is still running.
                    self.config_change = Some(ConfigChange::AddingServer { id, finalize_index });
                }
            },
            Some(ConfigChange::RemovingServer { id, entry_index }) => {
                if entry_index == index {
                    self.finish_remove_server(id);
                } else {
                    self.config_change = Some(ConfigChange::RemovingServer { id, entry_index });
                }
            }
            None => {}
        }
    }

    /// The removal entry is committed: tell the departing server, then drop
    /// its peer state.
    fn finish_remove_server(&mut self, server_id: ServerId) {
        slog::info!(self.logger, "Removal of server {} committed; releasing peer state", server_id);
        self.close_snapshot_transfer(server_id);
        self.heartbeat_timers.remove(&server_id);

        if let Some(peer) = self.peers.get(server_id) {
            let request = RaftRequest::CustomNotification(CustomNotificationRequest {
                header: self.request_header(server_id, "custom_notification_request"),
                kind: CustomNotificationKind::LeaveGroup,
            });
            let client = Arc::clone(&peer.client);
            let logger = self.logger.clone();
            tokio::task::spawn(async move {
                // Best effort; the server also notices via pre-vote
                // abandoned markers if this never arrives.
                if let Err(error) = client.send(request).await {
                    slog::info!(logger, "Leave notification undeliverable: {}", error);
                }
            });
        }

        let departed = self.peers.remove(server_id);
        if let Some(peer) = departed {
            if let Some(transfer) = peer.snapshot_transfer {
                Self::free_transfer_ctx(&self.state_machine, transfer);
            }
        }
        self.refresh_open_ctx_count();
    }
}
