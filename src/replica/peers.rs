use crate::commitlog::LogIndex;
use crate::replica::cluster_config::{ClusterConfig, ServerDescriptor, ServerId};
use crate::replica::snapshot::SnapshotTransfer;
use crate::transport::{PeerRpc, Transport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

/// Peer is the local server's mutable view of one remote member. It is
/// exclusively owned by the coordination task; workers only ever see a
/// `ServerId` and the cloned RPC client handle.
pub struct Peer {
    descriptor: ServerDescriptor,
    pub client: Arc<dyn PeerRpc>,

    /// Next log slot to ship to this peer.
    pub next_index: LogIndex,
    /// Highest index confirmed durable on this peer. Never regresses.
    pub matched_index: LogIndex,

    pub last_sent_at: Option<Instant>,
    pub last_response_at: Option<Instant>,
    pub needs_reconnect: bool,

    /// Latest back-pressure hint this peer returned.
    pub batch_size_hint_in_bytes: i64,

    /// Live snapshot transfer to this peer, if it fell behind the log.
    pub snapshot_transfer: Option<SnapshotTransfer>,

    // Claimed by `make_busy`; shared with reporting APIs.
    in_flight: Arc<AtomicBool>,
}

impl Peer {
    pub fn new(descriptor: ServerDescriptor, transport: &dyn Transport) -> Self {
        let client = transport.connect(&descriptor.endpoint);
        Peer {
            descriptor,
            client,
            next_index: LogIndex::new(1),
            matched_index: LogIndex::ZERO,
            last_sent_at: None,
            last_response_at: None,
            needs_reconnect: false,
            batch_size_hint_in_bytes: 0,
            snapshot_transfer: None,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ServerId {
        self.descriptor.id
    }

    pub fn endpoint(&self) -> &str {
        &self.descriptor.endpoint
    }

    pub fn priority(&self) -> i32 {
        self.descriptor.priority
    }

    pub fn is_regular_member(&self) -> bool {
        self.descriptor.is_regular_member()
    }

    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    pub fn update_descriptor(&mut self, descriptor: ServerDescriptor) {
        self.descriptor = descriptor;
    }

    /// Claim the single in-flight request slot. Returns false if a request
    /// is already outstanding; the caller must back off.
    pub fn make_busy(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn set_free(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Time since this peer last answered anything, measured from `now`.
    /// A peer that never answered counts as inactive forever.
    pub fn inactive_for(&self, now: Instant) -> Duration {
        match self.last_response_at {
            Some(at) => now.saturating_duration_since(at),
            None => Duration::MAX,
        }
    }

    pub fn recreate_client(&mut self, transport: &dyn Transport) {
        self.client = transport.connect(&self.descriptor.endpoint);
        self.needs_reconnect = false;
        // The old connection's outstanding request, if any, is abandoned.
        self.set_free();
    }
}

/// The coordination task's registry of every remote member. Kept in sync
/// with whatever cluster configuration is currently authoritative.
pub struct PeerTracker {
    my_id: ServerId,
    peers: HashMap<ServerId, Peer>,
    transport: Arc<dyn Transport>,
}

impl PeerTracker {
    pub fn new(my_id: ServerId, transport: Arc<dyn Transport>) -> Self {
        PeerTracker {
            my_id,
            peers: HashMap::new(),
            transport,
        }
    }

    pub fn my_id(&self) -> ServerId {
        self.my_id
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_arc(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn get(&self, id: ServerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut Peer> {
        self.peers.get_mut(&id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Peer> {
        self.peers.values_mut()
    }

    pub fn ids(&self) -> Vec<ServerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Add a peer for `descriptor`, or refresh the descriptor of one we
    /// already track. New peers start replicating at `next_index`.
    pub fn insert_or_update(&mut self, descriptor: ServerDescriptor, next_index: LogIndex) {
        match self.peers.get_mut(&descriptor.id) {
            Some(peer) => peer.update_descriptor(descriptor),
            None => {
                let id = descriptor.id;
                let mut peer = Peer::new(descriptor, self.transport.as_ref());
                peer.next_index = next_index;
                self.peers.insert(id, peer);
            }
        }
    }

    pub fn remove(&mut self, id: ServerId) -> Option<Peer> {
        self.peers.remove(&id)
    }

    /// Reconcile the peer set with `config`. New servers get fresh peer
    /// records (replication state starts at `next_index`), departed servers
    /// are returned to the caller so their snapshot contexts can be freed.
    pub fn sync_with_config(&mut self, config: &ClusterConfig, next_index: LogIndex) -> Vec<Peer> {
        for server in &config.servers {
            if server.id == self.my_id {
                continue;
            }
            match self.peers.get_mut(&server.id) {
                Some(peer) => peer.update_descriptor(server.clone()),
                None => {
                    let mut peer = Peer::new(server.clone(), self.transport.as_ref());
                    peer.next_index = next_index;
                    self.peers.insert(server.id, peer);
                }
            }
        }

        let departed_ids: Vec<ServerId> = self
            .peers
            .keys()
            .copied()
            .filter(|id| !config.contains(*id))
            .collect();
        departed_ids
            .into_iter()
            .filter_map(|id| self.peers.remove(&id))
            .collect()
    }
}
