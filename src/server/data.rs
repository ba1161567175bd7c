//! Shared server state: store, replication bookkeeping, and the metadata fixed at startup.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::parser::command::Command;
use crate::replication::replica_manager::{ReplicaManager, ReplicaSender};
use crate::storage::kv::Store;
use crate::{log_info, log_warn};

use super::metadata::{ReplicaInfo, ServerMetadata};

pub struct MasterLiveData {
    pub replication_offset: u64,
    pub replica_manager: ReplicaManager,
}

pub struct SlaveLiveData {
    pub processed_from_master: u64,
}

pub enum LiveData {
    Master(MasterLiveData),
    Slave(SlaveLiveData),
}

pub struct Server {
    pub metadata: ServerMetadata,
    pub live_data: Mutex<LiveData>,
    pub store: Mutex<Store>,
}

/// Millisecond Unix timestamp, used to resolve the `*` and `ms-*` XADD ID forms.
pub fn current_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

impl Server {
    pub fn new(metadata: ServerMetadata) -> Arc<Server> {
        let live_data = match metadata.replica_info {
            ReplicaInfo::Master(_) => LiveData::Master(MasterLiveData {
                replication_offset: 0,
                replica_manager: ReplicaManager::new(),
            }),
            ReplicaInfo::Slave(_) => LiveData::Slave(SlaveLiveData {
                processed_from_master: 0,
            }),
        };
        Arc::new(Server {
            metadata,
            live_data: Mutex::new(live_data),
            store: Mutex::new(Store::new()),
        })
    }

    pub fn is_master(&self) -> bool {
        matches!(self.metadata.replica_info, ReplicaInfo::Master(_))
    }

    pub fn load_snapshot_entries(&self, entries: HashMap<Vec<u8>, (Vec<u8>, Option<u64>)>) {
        log_info!("loaded {} key(s) from snapshot", entries.len());
        self.store.lock().unwrap().load_snapshot(entries, current_millis());
    }

    pub fn replication_offset(&self) -> u64 {
        match &*self.live_data.lock().unwrap() {
            LiveData::Master(m) => m.replication_offset,
            LiveData::Slave(_) => 0,
        }
    }

    pub fn add_replica(&self, addr: SocketAddr, sender: ReplicaSender) {
        if let LiveData::Master(m) = &mut *self.live_data.lock().unwrap() {
            m.replica_manager.add(addr, sender);
            log_info!(
                "replica {} attached, {} total",
                addr,
                m.replica_manager.count()
            );
        }
    }

    pub fn record_replica_ack(&self, addr: SocketAddr, offset: u64) {
        if let LiveData::Master(m) = &mut *self.live_data.lock().unwrap() {
            m.replica_manager.record_ack(addr, offset);
        }
    }

    pub fn remove_replica(&self, addr: SocketAddr) {
        if let LiveData::Master(m) = &mut *self.live_data.lock().unwrap() {
            m.replica_manager.remove(addr);
            log_info!(
                "replica {} detached, {} remaining",
                addr,
                m.replica_manager.count()
            );
        }
    }

    /// Propagate a write command to every replica, advancing the leader's replication
    /// offset by the exact encoded length. Returns that length.
    pub fn propagate(&self, command: &Command) -> u64 {
        let payload = command.to_wire().encode();
        if let LiveData::Master(m) = &mut *self.live_data.lock().unwrap() {
            m.replica_manager.propagate(&payload);
            m.replication_offset += payload.len() as u64;
        }
        payload.len() as u64
    }

    /// Apply a command decoded from the leader's stream to the local store. Errors (type
    /// mismatch, non-monotonic stream ID) are logged and otherwise ignored — the leader is
    /// assumed to have already accepted the command, so a local failure here indicates the
    /// two stores have diverged, which this server has no remediation for.
    pub fn apply_replicated_write(&self, command: &Command) {
        let mut store = self.store.lock().unwrap();
        let result = match command {
            Command::Set { key, value, px } => {
                let expire_at = px.map(|ms| Instant::now() + Duration::from_millis(*ms));
                store.set(key, value, expire_at).map(|_| ())
            }
            Command::Xadd {
                key,
                id_spec,
                fields,
            } => store
                .xadd_and_notify(key, id_spec, fields.clone(), current_millis())
                .map(|_| ()),
            _ => Ok(()),
        };
        if let Err(e) = result {
            log_warn!("failed to apply replicated command {:?}: {}", command, e);
        }
    }

    pub fn set_follower_offset(&self, offset: u64) {
        if let LiveData::Slave(s) = &mut *self.live_data.lock().unwrap() {
            s.processed_from_master = offset;
        }
    }

    pub fn follower_offset(&self) -> u64 {
        match &*self.live_data.lock().unwrap() {
            LiveData::Slave(s) => s.processed_from_master,
            LiveData::Master(_) => 0,
        }
    }
}
