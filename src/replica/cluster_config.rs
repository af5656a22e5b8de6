use crate::commitlog::{EntryKind, LogEntry, LogIndex, Term};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// ServerId identifies a member of the replication group. `-1` is the
/// "no server" sentinel (unknown leader, empty peer-info response).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ServerId(i32);

impl ServerId {
    pub const NONE: ServerId = ServerId(-1);

    pub fn new(id: i32) -> Self {
        ServerId(id)
    }

    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_none(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One server's membership descriptor within a cluster configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerDescriptor {
    pub id: ServerId,
    pub endpoint: String,
    /// Election priority. Zero means "never initiate an election" unless the
    /// temporary zero-priority escape condition holds.
    pub priority: i32,
    /// Learners replicate but never vote and never count toward quorum.
    pub is_learner: bool,
    /// Transient exclusion from quorum while a freshly added server catches
    /// up; cleared by the finalizing configuration entry.
    pub is_new_joiner: bool,
}

impl ServerDescriptor {
    pub fn new(id: ServerId, endpoint: impl Into<String>, priority: i32) -> Self {
        ServerDescriptor {
            id,
            endpoint: endpoint.into(),
            priority,
            is_learner: false,
            is_new_joiner: false,
        }
    }

    pub fn learner(id: ServerId, endpoint: impl Into<String>) -> Self {
        ServerDescriptor {
            id,
            endpoint: endpoint.into(),
            priority: 0,
            is_learner: true,
            is_new_joiner: false,
        }
    }

    /// A regular member replicates, votes, and counts toward quorum.
    pub fn is_regular_member(&self) -> bool {
        !self.is_learner && !self.is_new_joiner
    }
}

/// The ordered membership of the group. A configuration is itself a log
/// entry; the latest one in the log (committed or not) is authoritative and
/// takes effect the moment it is appended. Changes are one at a time.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ClusterConfig {
    /// Index of the log entry carrying this configuration, zero before it
    /// has been appended anywhere.
    pub log_index: LogIndex,
    /// Index of the configuration this one replaced.
    pub prev_log_index: LogIndex,
    pub servers: Vec<ServerDescriptor>,
}

impl ClusterConfig {
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        ClusterConfig {
            log_index: LogIndex::ZERO,
            prev_log_index: LogIndex::ZERO,
            servers,
        }
    }

    pub fn get_server(&self, id: ServerId) -> Option<&ServerDescriptor> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.get_server(id).is_some()
    }

    pub fn voting_members(&self) -> impl Iterator<Item = &ServerDescriptor> {
        self.servers.iter().filter(|s| s.is_regular_member())
    }

    pub fn num_voting_members(&self) -> usize {
        self.voting_members().count()
    }

    pub fn max_priority(&self) -> i32 {
        self.servers.iter().map(|s| s.priority).max().unwrap_or(0)
    }

    /// Serialized form carried in a `Configuration` log entry.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u64(self.log_index.as_u64());
        buf.put_u64(self.prev_log_index.as_u64());
        buf.put_u32(self.servers.len() as u32);
        for server in &self.servers {
            buf.put_i32(server.id.as_i32());
            buf.put_u16(server.endpoint.len() as u16);
            buf.put_slice(server.endpoint.as_bytes());
            buf.put_i32(server.priority);
            let mut flags = 0u8;
            if server.is_learner {
                flags |= 0x1;
            }
            if server.is_new_joiner {
                flags |= 0x2;
            }
            buf.put_u8(flags);
        }
        buf.freeze()
    }

    pub fn from_bytes(mut buf: Bytes) -> Result<Self, ConfigDecodeError> {
        if buf.remaining() < 20 {
            return Err(ConfigDecodeError::Truncated);
        }
        let log_index = LogIndex::new(buf.get_u64());
        let prev_log_index = LogIndex::new(buf.get_u64());
        let count = buf.get_u32() as usize;
        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            if buf.remaining() < 6 {
                return Err(ConfigDecodeError::Truncated);
            }
            let id = ServerId::new(buf.get_i32());
            let endpoint_len = buf.get_u16() as usize;
            if buf.remaining() < endpoint_len + 5 {
                return Err(ConfigDecodeError::Truncated);
            }
            let endpoint_bytes = buf.copy_to_bytes(endpoint_len);
            let endpoint =
                String::from_utf8(endpoint_bytes.to_vec()).map_err(|_| ConfigDecodeError::BadEndpoint(id))?;
            let priority = buf.get_i32();
            let flags = buf.get_u8();
            servers.push(ServerDescriptor {
                id,
                endpoint,
                priority,
                is_learner: flags & 0x1 != 0,
                is_new_joiner: flags & 0x2 != 0,
            });
        }
        Ok(ClusterConfig {
            log_index,
            prev_log_index,
            servers,
        })
    }

    pub fn to_log_entry(&self, term: Term) -> LogEntry {
        LogEntry::new(term, EntryKind::Configuration, self.to_bytes())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigDecodeError {
    #[error("configuration entry payload is truncated")]
    Truncated,
    #[error("configuration entry has non-utf8 endpoint for server {0}")]
    BadEndpoint(ServerId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bytes() {
        let mut config = ClusterConfig::new(vec![
            ServerDescriptor::new(ServerId::new(1), "s1.local:20010", 85),
            ServerDescriptor::learner(ServerId::new(2), "s2.local:20020"),
            ServerDescriptor {
                id: ServerId::new(3),
                endpoint: "s3.local:20030".to_string(),
                priority: 1,
                is_learner: false,
                is_new_joiner: true,
            },
        ]);
        config.log_index = LogIndex::new(7);
        config.prev_log_index = LogIndex::new(2);

        let decoded = ClusterConfig::from_bytes(config.to_bytes()).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn rejects_truncated_payload() {
        let config = ClusterConfig::new(vec![ServerDescriptor::new(ServerId::new(1), "a:1", 1)]);
        let bytes = config.to_bytes();
        let truncated = bytes.slice(0..bytes.len() - 2);
        assert!(matches!(
            ClusterConfig::from_bytes(truncated),
            Err(ConfigDecodeError::Truncated)
        ));
    }

    #[test]
    fn quorum_counting_excludes_learners_and_joiners() {
        let config = ClusterConfig::new(vec![
            ServerDescriptor::new(ServerId::new(1), "a:1", 1),
            ServerDescriptor::new(ServerId::new(2), "b:1", 1),
            ServerDescriptor::learner(ServerId::new(3), "c:1"),
            ServerDescriptor {
                id: ServerId::new(4),
                endpoint: "d:1".to_string(),
                priority: 1,
                is_learner: false,
                is_new_joiner: true,
            },
        ]);
        assert_eq!(config.num_voting_members(), 2);
    }
}
