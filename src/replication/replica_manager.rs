//! The leader-side replica registry: one entry per attached follower, each fed by its own
//! unbounded channel so a slow replica's socket never blocks the command path that produced
//! the write.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, Notify};

pub type ReplicaSender = mpsc::UnboundedSender<Vec<u8>>;

struct Replica {
    addr: SocketAddr,
    sender: ReplicaSender,
    bytes_propagated: u64,
    bytes_acked: u64,
}

/// Insertion-ordered (iterated in attach order), so propagation fan-out and the WAIT sample
/// always observe replicas in the order they joined.
pub struct ReplicaManager {
    replicas: Vec<Replica>,
    /// Fired whenever any replica's acked offset changes, so WAIT can wake without polling.
    pub ack_notify: Arc<Notify>,
}

impl Default for ReplicaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self {
            replicas: Vec::new(),
            ack_notify: Arc::new(Notify::new()),
        }
    }

    pub fn add(&mut self, addr: SocketAddr, sender: ReplicaSender) {
        self.replicas.retain(|r| r.addr != addr);
        self.replicas.push(Replica {
            addr,
            sender,
            bytes_propagated: 0,
            bytes_acked: 0,
        });
    }

    pub fn remove(&mut self, addr: SocketAddr) {
        self.replicas.retain(|r| r.addr != addr);
    }

    pub fn count(&self) -> usize {
        self.replicas.len()
    }

    /// Fan a propagated write out to every replica, advancing each one's `bytes_propagated`
    /// by the exact encoded length.
    pub fn propagate(&mut self, payload: &[u8]) {
        for replica in &mut self.replicas {
            let _ = replica.sender.send(payload.to_vec());
            replica.bytes_propagated += payload.len() as u64;
        }
    }

    pub fn record_ack(&mut self, addr: SocketAddr, offset: u64) {
        if let Some(replica) = self.replicas.iter_mut().find(|r| r.addr == addr) {
            replica.bytes_acked = offset;
        }
        self.ack_notify.notify_waiters();
    }

    /// Replicas with no outstanding writes count as already caught up; the rest receive a
    /// `GETACK` and have their `bytes_propagated` snapshotted at the moment it was sent.
    pub fn send_getack(&mut self, getack_payload: &[u8]) -> (usize, Vec<(SocketAddr, u64)>) {
        let mut already_caught_up = 0;
        let mut targets = Vec::new();
        for replica in &mut self.replicas {
            if replica.bytes_propagated == 0 {
                already_caught_up += 1;
                continue;
            }
            targets.push((replica.addr, replica.bytes_propagated));
            let _ = replica.sender.send(getack_payload.to_vec());
            replica.bytes_propagated += getack_payload.len() as u64;
        }
        (already_caught_up, targets)
    }

    /// How many of `targets` have acked at least their snapshotted offset, right now.
    pub fn count_caught_up(&self, targets: &[(SocketAddr, u64)]) -> usize {
        targets
            .iter()
            .filter(|(addr, target)| {
                self.replicas
                    .iter()
                    .any(|r| r.addr == *addr && r.bytes_acked >= *target)
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        ([127, 0, 0, 1], port).into()
    }

    #[test]
    fn propagate_advances_bytes_propagated_for_every_replica() {
        let mut manager = ReplicaManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        manager.add(addr(1), tx1);
        manager.add(addr(2), tx2);

        manager.propagate(b"hello");

        assert_eq!(rx1.try_recv().unwrap(), b"hello".to_vec());
        assert_eq!(rx2.try_recv().unwrap(), b"hello".to_vec());

        let (caught_up, targets) = manager.send_getack(b"GETACK");
        assert_eq!(caught_up, 0);
        assert_eq!(targets, vec![(addr(1), 5), (addr(2), 5)]);
    }

    #[test]
    fn replicas_with_no_writes_count_as_caught_up_immediately() {
        let mut manager = ReplicaManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add(addr(1), tx);

        let (caught_up, targets) = manager.send_getack(b"GETACK");
        assert_eq!(caught_up, 1);
        assert!(targets.is_empty());
    }

    #[test]
    fn count_caught_up_requires_ack_at_or_past_target() {
        let mut manager = ReplicaManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        manager.add(addr(1), tx);
        manager.propagate(b"12345");
        let targets = vec![(addr(1), 5)];
        assert_eq!(manager.count_caught_up(&targets), 0);
        manager.record_ack(addr(1), 5);
        assert_eq!(manager.count_caught_up(&targets), 1);
    }
}
