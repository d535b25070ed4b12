//! In-memory transport for consensus messages.
//!
//! Simulates a fully connected validator network without sockets. Nodes
//! join a shared hub, receive `NetworkEvent`s on an unbounded channel and
//! can be isolated or partitioned from each other to exercise liveness
//! paths (silent primaries, split networks).

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use themis_crypto::PublicKey;
use tokio::sync::mpsc;

use crate::network::{NetworkEvent, P2pError, P2pService, PeerId, PeerInfo};

const ADDRESS_PREFIX: &str = "mem://";

struct Node {
    info: PeerInfo,
    tx: mpsc::UnboundedSender<NetworkEvent>,
}

#[derive(Default)]
struct Hub {
    nodes: HashMap<PeerId, Node>,
    next_id: u64,
    isolated: HashSet<PeerId>,
    /// Directional blocks: `(from, to)` drops traffic from `from` to `to`.
    blocked: HashSet<(PeerId, PeerId)>,
    dropped: u64,
}

impl Hub {
    fn can_deliver(&self, from: PeerId, to: PeerId) -> bool {
        !self.isolated.contains(&from)
            && !self.isolated.contains(&to)
            && !self.blocked.contains(&(from, to))
    }
}

/// Shared hub all in-memory transports attach to.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Every existing node sees `Connected` for the newcomer
    /// and the newcomer sees `Connected` for each existing node.
    pub fn join(&self, public_key: PublicKey) -> (MemoryTransport, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut hub = self.inner.lock();
        let id = PeerId(hub.next_id);
        hub.next_id += 1;
        let info = PeerInfo {
            id,
            public_key,
            address: format!("{}{}", ADDRESS_PREFIX, id.0),
            height: 0,
        };
        for node in hub.nodes.values() {
            let _ = node.tx.send(NetworkEvent::Connected(info.clone()));
            let _ = tx.send(NetworkEvent::Connected(node.info.clone()));
        }
        hub.nodes.insert(id, Node { info, tx });
        log::debug!("memory network: {} joined ({} nodes)", id, hub.nodes.len());
        (
            MemoryTransport {
                network: self.clone(),
                id,
            },
            rx,
        )
    }

    /// Remove a node; remaining nodes see `Disconnected`.
    pub fn leave(&self, id: PeerId) {
        let mut hub = self.inner.lock();
        if hub.nodes.remove(&id).is_some() {
            for node in hub.nodes.values() {
                let _ = node.tx.send(NetworkEvent::Disconnected(id));
            }
        }
        hub.isolated.remove(&id);
        hub.blocked.retain(|(a, b)| *a != id && *b != id);
    }

    /// Drop all traffic to and from `id`.
    pub fn isolate(&self, id: PeerId) {
        self.inner.lock().isolated.insert(id);
    }

    pub fn reconnect(&self, id: PeerId) {
        self.inner.lock().isolated.remove(&id);
    }

    /// Drop traffic from `from` to `to` (one direction only).
    pub fn partition(&self, from: PeerId, to: PeerId) {
        self.inner.lock().blocked.insert((from, to));
    }

    pub fn heal(&self) {
        let mut hub = self.inner.lock();
        hub.isolated.clear();
        hub.blocked.clear();
    }

    /// Messages dropped by isolation or partitions so far.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    pub fn height_of(&self, id: PeerId) -> Option<u32> {
        self.inner.lock().nodes.get(&id).map(|n| n.info.height)
    }

    fn deliver(&self, from: PeerId, to: PeerId, payload: Vec<u8>) -> Result<(), P2pError> {
        let mut hub = self.inner.lock();
        if !hub.nodes.contains_key(&to) {
            return Err(P2pError::UnknownPeer(to));
        }
        if !hub.can_deliver(from, to) {
            hub.dropped += 1;
            return Ok(());
        }
        if let Some(node) = hub.nodes.get(&to) {
            node.tx
                .send(NetworkEvent::Message { from, payload })
                .map_err(|_| P2pError::Closed)?;
        }
        Ok(())
    }
}

/// One node's handle onto a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    id: PeerId,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }
}

impl P2pService for MemoryTransport {
    fn local_id(&self) -> PeerId {
        self.id
    }

    fn local_address(&self) -> String {
        format!("{}{}", ADDRESS_PREFIX, self.id.0)
    }

    fn broadcast(&self, payload: Vec<u8>) {
        let targets: Vec<PeerId> = {
            let hub = self.network.inner.lock();
            hub.nodes.keys().copied().filter(|id| *id != self.id).collect()
        };
        for to in targets {
            if let Err(e) = self.network.deliver(self.id, to, payload.clone()) {
                log::debug!("broadcast from {} to {} failed: {}", self.id, to, e);
            }
        }
    }

    fn send(&self, peer: PeerId, payload: Vec<u8>) -> Result<(), P2pError> {
        self.network.deliver(self.id, peer, payload)
    }

    fn connect(&self, address: &str) -> Result<PeerId, P2pError> {
        let id = address
            .strip_prefix(ADDRESS_PREFIX)
            .and_then(|rest| rest.parse::<u64>().ok())
            .map(PeerId)
            .ok_or_else(|| P2pError::Unreachable(address.to_string()))?;
        if self.network.inner.lock().nodes.contains_key(&id) {
            Ok(id)
        } else {
            Err(P2pError::Unreachable(address.to_string()))
        }
    }

    fn get_neighbors(&self) -> Vec<PeerInfo> {
        let hub = self.network.inner.lock();
        let mut out: Vec<PeerInfo> = hub
            .nodes
            .values()
            .filter(|n| n.info.id != self.id && hub.can_deliver(self.id, n.info.id))
            .map(|n| n.info.clone())
            .collect();
        out.sort_by_key(|p| p.id);
        out
    }

    fn is_own_address(&self, address: &str) -> bool {
        address == self.local_address()
    }

    fn set_height(&self, height: u32) {
        if let Some(node) = self.network.inner.lock().nodes.get_mut(&self.id) {
            node.info.height = height;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use themis_crypto::KeyPair;

    fn pk(i: u8) -> PublicKey {
        KeyPair::from_seed(&[i; 32]).unwrap().public().clone()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<NetworkEvent>) -> Vec<NetworkEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn test_join_announces_both_ways() {
        let net = MemoryNetwork::new();
        let (_a, mut rx_a) = net.join(pk(1));
        let (b, mut rx_b) = net.join(pk(2));
        let ev_a = drain(&mut rx_a);
        assert!(matches!(&ev_a[..], [NetworkEvent::Connected(info)] if info.id == b.local_id()));
        let ev_b = drain(&mut rx_b);
        assert!(matches!(&ev_b[..], [NetworkEvent::Connected(info)] if info.public_key == pk(1)));
    }

    #[test]
    fn test_broadcast_skips_self_and_isolated() {
        let net = MemoryNetwork::new();
        let (a, mut rx_a) = net.join(pk(1));
        let (b, mut rx_b) = net.join(pk(2));
        let (c, mut rx_c) = net.join(pk(3));
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        net.isolate(c.local_id());
        a.broadcast(vec![1]);
        assert_eq!(drain(&mut rx_a).len(), 0);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 0);
        assert_eq!(net.dropped(), 1);

        net.reconnect(c.local_id());
        b.send(c.local_id(), vec![2]).unwrap();
        assert!(matches!(
            &drain(&mut rx_c)[..],
            [NetworkEvent::Message { from, payload }] if *from == b.local_id() && payload == &vec![2]
        ));
    }

    #[test]
    fn test_partition_is_directional() {
        let net = MemoryNetwork::new();
        let (a, mut rx_a) = net.join(pk(1));
        let (b, mut rx_b) = net.join(pk(2));
        drain(&mut rx_a);
        drain(&mut rx_b);
        net.partition(a.local_id(), b.local_id());
        a.broadcast(vec![1]);
        b.broadcast(vec![2]);
        assert_eq!(drain(&mut rx_b).len(), 0);
        assert_eq!(drain(&mut rx_a).len(), 1);
        net.heal();
        a.broadcast(vec![3]);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[test]
    fn test_connect_and_addresses() {
        let net = MemoryNetwork::new();
        let (a, _rx_a) = net.join(pk(1));
        let (b, _rx_b) = net.join(pk(2));
        assert_eq!(a.connect("mem://1").unwrap(), b.local_id());
        assert!(a.connect("mem://9").is_err());
        assert!(a.connect("tcp://1").is_err());
        assert!(a.is_own_address("mem://0"));
        assert!(!a.is_own_address("mem://1"));
        a.set_height(7);
        assert_eq!(net.height_of(a.local_id()), Some(7));
        assert_eq!(b.get_neighbors()[0].height, 7);
    }

    #[test]
    fn test_leave_notifies_and_send_fails() {
        let net = MemoryNetwork::new();
        let (a, mut rx_a) = net.join(pk(1));
        let (b, _rx_b) = net.join(pk(2));
        drain(&mut rx_a);
        net.leave(b.local_id());
        assert!(matches!(&drain(&mut rx_a)[..], [NetworkEvent::Disconnected(id)] if *id == b.local_id()));
        assert_eq!(a.send(b.local_id(), vec![1]), Err(P2pError::UnknownPeer(b.local_id())));
    }
}
