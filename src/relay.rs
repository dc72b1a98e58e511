//! # Relay State
//!
//! Two sides of indirect reachability:
//!
//! - [`Relay`] is the server side: the set of peers this node forwards
//!   traffic for. Peers enter it through an authenticated `StartRelay` and
//!   leave through `StopRelay`.
//! - [`Proxy`] is the client side: the peers this node sends its own traffic
//!   through, rotated round-robin.
//!
//! Authentication gating lives in the DHT dispatch; these structures only
//! track membership.

use crate::id::{NodeId, Peer};

/// Peers this node relays traffic for.
#[derive(Debug, Default)]
pub struct Relay {
    clients: Vec<Peer>,
}

impl Relay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Re-adding an existing client is an error, mirroring the
    /// wire contract where a second `StartRelay` reports `Error`.
    pub fn add_client(&mut self, peer: Peer) -> Result<(), RelayStateError> {
        if self.clients.iter().any(|c| c.id == peer.id) {
            return Err(RelayStateError::AlreadyClient(peer.id));
        }
        self.clients.push(peer);
        Ok(())
    }

    pub fn remove_client(&mut self, id: &NodeId) -> Result<(), RelayStateError> {
        let before = self.clients.len();
        self.clients.retain(|c| c.id != *id);
        if self.clients.len() == before {
            return Err(RelayStateError::NotAClient(*id));
        }
        Ok(())
    }

    pub fn clients_count(&self) -> usize {
        self.clients.len()
    }

    /// Whether traffic from `address` belongs to a relayed client and must be
    /// forwarded when it names a third-party receiver.
    pub fn need_to_relay(&self, address: &str) -> bool {
        self.clients.iter().any(|c| c.address.to_string() == address)
    }
}

/// Peers this node sends its own traffic through.
#[derive(Debug, Default)]
pub struct Proxy {
    proxies: Vec<Peer>,
    next: usize,
}

impl Proxy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_proxy(&mut self, peer: Peer) {
        if !self.proxies.iter().any(|p| p.id == peer.id) {
            self.proxies.push(peer);
        }
    }

    pub fn remove_proxy(&mut self, id: &NodeId) {
        self.proxies.retain(|p| p.id != *id);
        if self.next >= self.proxies.len() {
            self.next = 0;
        }
    }

    pub fn proxy_count(&self) -> usize {
        self.proxies.len()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.proxies.iter().any(|p| p.id == *id)
    }

    /// Next proxy in round-robin order.
    pub fn next_proxy(&mut self) -> Option<Peer> {
        if self.proxies.is_empty() {
            return None;
        }
        let peer = self.proxies[self.next % self.proxies.len()];
        self.next = (self.next + 1) % self.proxies.len();
        Some(peer)
    }
}

/// Membership errors for the relay client set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStateError {
    AlreadyClient(NodeId),
    NotAClient(NodeId),
}

impl std::fmt::Display for RelayStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayStateError::AlreadyClient(id) => write!(f, "{} is already a relay client", id),
            RelayStateError::NotAClient(id) => write!(f, "{} is not a relay client", id),
        }
    }
}

impl std::error::Error for RelayStateError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Address, NODE_HASH_LEN};

    fn peer(seed: u8) -> Peer {
        let mut bytes = [0u8; NODE_HASH_LEN];
        bytes[0] = seed;
        Peer::new(
            NodeId::from_bytes(bytes),
            Address::new(&format!("127.0.0.1:{}", 11000 + seed as u16)).unwrap(),
        )
    }

    #[test]
    fn relay_membership_round_trip() {
        let mut relay = Relay::new();
        let client = peer(1);

        relay.add_client(client).unwrap();
        assert_eq!(relay.clients_count(), 1);
        assert!(relay.need_to_relay(&client.address.to_string()));

        assert_eq!(
            relay.add_client(client),
            Err(RelayStateError::AlreadyClient(client.id))
        );

        relay.remove_client(&client.id).unwrap();
        assert_eq!(relay.clients_count(), 0);
        assert!(!relay.need_to_relay(&client.address.to_string()));

        assert_eq!(
            relay.remove_client(&client.id),
            Err(RelayStateError::NotAClient(client.id))
        );
    }

    #[test]
    fn proxy_rotates_round_robin() {
        let mut proxy = Proxy::new();
        assert_eq!(proxy.next_proxy(), None);

        proxy.add_proxy(peer(1));
        proxy.add_proxy(peer(2));
        proxy.add_proxy(peer(1)); // duplicate ignored
        assert_eq!(proxy.proxy_count(), 2);

        assert_eq!(proxy.next_proxy().unwrap().id, peer(1).id);
        assert_eq!(proxy.next_proxy().unwrap().id, peer(2).id);
        assert_eq!(proxy.next_proxy().unwrap().id, peer(1).id);
    }

    #[test]
    fn proxy_add_remove_restores_empty_state() {
        let mut proxy = Proxy::new();
        proxy.add_proxy(peer(1));
        assert!(proxy.contains(&peer(1).id));
        proxy.remove_proxy(&peer(1).id);
        assert!(!proxy.contains(&peer(1).id));
        assert_eq!(proxy.proxy_count(), 0);
        assert_eq!(proxy.next_proxy(), None);
    }
}
