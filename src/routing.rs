//! # Routing Table
//!
//! Kademlia-style K-buckets over the 160-bit XOR metric. One table exists per
//! origin identity the node presents; each table owns [`KEY_BIT_SIZE`]
//! buckets of up to [`MAX_CONTACTS_IN_BUCKET`] contacts ordered
//! least-recently-seen first.
//!
//! The table itself never touches the network. When a bucket is full,
//! [`RoutingTable::upsert`] hands back a [`PendingEviction`]; the caller pings
//! the stale head and settles the outcome with
//! [`RoutingTable::apply_ping_result`].

use std::time::{Duration, Instant};

use crate::id::{bucket_index, distance_cmp, Key, NodeId, Peer, KEY_BIT_SIZE};

/// K: bucket capacity and replication factor.
pub const MAX_CONTACTS_IN_BUCKET: usize = 20;

/// α: number of parallel calls per iterative query round.
pub const PARALLEL_CALLS: usize = 3;

/// A peer as held in the routing table, with freshness information.
#[derive(Clone, Debug)]
pub struct Contact {
    pub peer: Peer,
    pub last_seen: Instant,
}

impl Contact {
    fn new(peer: Peer) -> Self {
        Self {
            peer,
            last_seen: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    /// Least-recently-seen contact at the head.
    contacts: Vec<Contact>,
    last_refresh: Instant,
}

impl Bucket {
    fn new() -> Self {
        Self {
            contacts: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.contacts.iter().position(|c| c.peer.id == *id)
    }

    fn mark_seen(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                let mut contact = self.contacts.remove(pos);
                contact.last_seen = Instant::now();
                self.contacts.push(contact);
                self.last_refresh = Instant::now();
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        match self.position(id) {
            Some(pos) => {
                self.contacts.remove(pos);
                true
            }
            None => false,
        }
    }
}

/// Result of inserting a peer into its bucket.
#[derive(Debug)]
pub enum UpsertOutcome {
    /// The peer was already present and has been marked fresh.
    Refreshed,
    /// The peer was appended to a bucket with free space.
    Inserted,
    /// The peer's identifier equals an origin identifier, or is the wildcard.
    Rejected,
    /// The bucket is full; ping the head and settle with
    /// [`RoutingTable::apply_ping_result`].
    Full(PendingEviction),
}

/// A full-bucket insertion awaiting the head's liveness verdict.
#[derive(Clone, Debug)]
pub struct PendingEviction {
    pub bucket: usize,
    pub head: Peer,
    pub candidate: Peer,
}

/// One routing table, keyed by a single origin identity.
#[derive(Debug)]
pub struct RoutingTable {
    origin: Peer,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(origin: Peer) -> Self {
        let mut buckets = Vec::with_capacity(KEY_BIT_SIZE);
        for _ in 0..KEY_BIT_SIZE {
            buckets.push(Bucket::new());
        }
        Self { origin, buckets }
    }

    pub fn origin(&self) -> &Peer {
        &self.origin
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        match bucket_index(&self.origin.id, id) {
            Some(idx) => self.buckets[idx].position(id).is_some(),
            None => false,
        }
    }

    /// Look a peer up by identifier.
    pub fn lookup(&self, id: &NodeId) -> Option<Peer> {
        let idx = bucket_index(&self.origin.id, id)?;
        self.buckets[idx]
            .contacts
            .iter()
            .find(|c| c.peer.id == *id)
            .map(|c| c.peer)
    }

    /// Mark an existing contact as seen, moving it to the bucket tail.
    pub fn mark_seen(&mut self, id: &NodeId) -> bool {
        match bucket_index(&self.origin.id, id) {
            Some(idx) => self.buckets[idx].mark_seen(id),
            None => false,
        }
    }

    /// Insert or refresh a peer per the K-bucket policy.
    pub fn upsert(&mut self, peer: Peer) -> UpsertOutcome {
        if peer.id.is_wildcard() {
            return UpsertOutcome::Rejected;
        }
        let idx = match bucket_index(&self.origin.id, &peer.id) {
            Some(idx) => idx,
            None => return UpsertOutcome::Rejected,
        };
        let bucket = &mut self.buckets[idx];

        if bucket.mark_seen(&peer.id) {
            return UpsertOutcome::Refreshed;
        }
        if bucket.contacts.len() < MAX_CONTACTS_IN_BUCKET {
            bucket.contacts.push(Contact::new(peer));
            bucket.last_refresh = Instant::now();
            return UpsertOutcome::Inserted;
        }
        let head = bucket.contacts[0].peer;
        UpsertOutcome::Full(PendingEviction {
            bucket: idx,
            head,
            candidate: peer,
        })
    }

    /// Settle a full-bucket insertion after pinging the head.
    ///
    /// A live head stays and the candidate is dropped; a dead head is evicted
    /// and the candidate appended at the tail.
    pub fn apply_ping_result(&mut self, pending: PendingEviction, head_alive: bool) {
        let bucket = &mut self.buckets[pending.bucket];
        if head_alive {
            bucket.mark_seen(&pending.head.id);
            return;
        }
        bucket.remove(&pending.head.id);
        let already_present = bucket.position(&pending.candidate.id).is_some();
        if !already_present && bucket.contacts.len() < MAX_CONTACTS_IN_BUCKET {
            bucket.contacts.push(Contact::new(pending.candidate));
            bucket.last_refresh = Instant::now();
        }
    }

    /// Up to `count` contacts closest to `target`, excluding `exclude`,
    /// sorted by XOR distance with lexicographic identifier tie-break.
    ///
    /// Buckets are visited starting at the target's bucket and expanding
    /// outward, stopping once enough candidates are gathered.
    pub fn closest(&self, target: &Key, count: usize, exclude: &[NodeId]) -> Vec<Peer> {
        if count == 0 {
            return Vec::new();
        }
        let target_id = NodeId::from(*target);
        let start = bucket_index(&self.origin.id, &target_id).unwrap_or(0);

        let mut candidates: Vec<Peer> = Vec::new();
        self.collect_bucket(start, exclude, &mut candidates);
        let mut offset = 1usize;
        while candidates.len() < count && (offset <= start || start + offset < KEY_BIT_SIZE) {
            if offset <= start {
                self.collect_bucket(start - offset, exclude, &mut candidates);
            }
            if start + offset < KEY_BIT_SIZE {
                self.collect_bucket(start + offset, exclude, &mut candidates);
            }
            offset += 1;
        }

        candidates.sort_by(|a, b| {
            let da = a.id.xor_distance(&target_id);
            let db = b.id.xor_distance(&target_id);
            distance_cmp(&da, &db).then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(count);
        candidates
    }

    fn collect_bucket(&self, idx: usize, exclude: &[NodeId], out: &mut Vec<Peer>) {
        for contact in &self.buckets[idx].contacts {
            if !exclude.contains(&contact.peer.id) {
                out.push(contact.peer);
            }
        }
    }

    pub fn total_nodes(&self) -> usize {
        self.buckets.iter().map(|b| b.contacts.len()).sum()
    }

    pub fn nodes_in_bucket(&self, idx: usize) -> usize {
        self.buckets[idx].contacts.len()
    }

    /// All known peers across every bucket.
    pub fn all_peers(&self) -> Vec<Peer> {
        self.buckets
            .iter()
            .flat_map(|b| b.contacts.iter().map(|c| c.peer))
            .collect()
    }

    /// Count of known nodes at least as close to `key` as this origin:
    /// everything in strictly-closer buckets plus same-bucket contacts that
    /// beat the origin's own distance. Drives the adaptive store TTL.
    pub fn closeness_score(&self, key: &Key) -> usize {
        let key_id = NodeId::from(*key);
        let bucket = match bucket_index(&self.origin.id, &key_id) {
            Some(idx) => idx,
            None => return self.total_nodes(),
        };
        let mut score = 0usize;
        for idx in 0..bucket {
            score += self.buckets[idx].contacts.len();
        }
        let origin_distance = self.origin.id.xor_distance(&key_id);
        for contact in &self.buckets[bucket].contacts {
            let d = contact.peer.id.xor_distance(&key_id);
            if distance_cmp(&d, &origin_distance).is_lt() {
                score += 1;
            }
        }
        score
    }

    /// Buckets whose last activity is older than `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.last_refresh.elapsed() > threshold)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn reset_refresh_time(&mut self, idx: usize) {
        if idx < self.buckets.len() {
            self.buckets[idx].last_refresh = Instant::now();
        }
    }

    /// A random identifier that falls into bucket `idx` of this table.
    pub fn random_id_in_bucket(&self, idx: usize) -> NodeId {
        let bit = KEY_BIT_SIZE - 1 - idx.min(KEY_BIT_SIZE - 1);
        let byte_idx = bit / 8;
        let bit_pos = bit % 8;

        let mut distance = [0u8; crate::id::NODE_HASH_LEN];
        if getrandom::getrandom(&mut distance).is_err() {
            for (i, byte) in distance.iter_mut().enumerate() {
                *byte = (idx.wrapping_mul(i + 1)) as u8;
            }
        }
        for byte in distance.iter_mut().take(byte_idx) {
            *byte = 0;
        }
        let target_bit = 0x80u8 >> bit_pos;
        distance[byte_idx] = target_bit | (distance[byte_idx] & target_bit.wrapping_sub(1));

        let origin = self.origin.id.as_bytes();
        let mut id = [0u8; crate::id::NODE_HASH_LEN];
        for i in 0..id.len() {
            id[i] = origin[i] ^ distance[i];
        }
        NodeId::from_bytes(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Address, NODE_HASH_LEN};

    fn origin() -> Peer {
        Peer::new(
            NodeId::from_bytes([0u8; NODE_HASH_LEN]),
            Address::new("127.0.0.1:9000").unwrap(),
        )
    }

    fn peer_with_prefix(first: u8, tail: u8) -> Peer {
        let mut bytes = [0u8; NODE_HASH_LEN];
        bytes[0] = first;
        bytes[NODE_HASH_LEN - 1] = tail;
        Peer::new(
            NodeId::from_bytes(bytes),
            Address::new(&format!("127.0.0.1:{}", 10000 + tail as u16)).unwrap(),
        )
    }

    #[test]
    fn one_contact_per_peer() {
        let mut table = RoutingTable::new(origin());
        let peer = peer_with_prefix(0x80, 1);

        assert!(matches!(table.upsert(peer), UpsertOutcome::Inserted));
        assert!(matches!(table.upsert(peer), UpsertOutcome::Refreshed));
        assert_eq!(table.total_nodes(), 1);
        assert_eq!(table.lookup(&peer.id), Some(peer));
    }

    #[test]
    fn self_and_wildcard_rejected() {
        let mut table = RoutingTable::new(origin());
        assert!(matches!(table.upsert(origin()), UpsertOutcome::Rejected));
        let wildcard = Peer::new(NodeId::WILDCARD, Address::new("127.0.0.1:9000").unwrap());
        assert!(matches!(table.upsert(wildcard), UpsertOutcome::Rejected));
        assert_eq!(table.total_nodes(), 0);
    }

    #[test]
    fn full_bucket_defers_to_ping_outcome() {
        let mut table = RoutingTable::new(origin());
        // All these share the top bit, so they land in one bucket.
        for tail in 0..MAX_CONTACTS_IN_BUCKET as u8 {
            let outcome = table.upsert(peer_with_prefix(0x80, tail + 1));
            assert!(matches!(outcome, UpsertOutcome::Inserted));
        }
        let head = peer_with_prefix(0x80, 1);
        let newcomer = peer_with_prefix(0x80, 100);

        let pending = match table.upsert(newcomer) {
            UpsertOutcome::Full(p) => p,
            other => panic!("expected full bucket, got {:?}", other),
        };
        assert_eq!(pending.head.id, head.id);

        // Live head: newcomer dropped, head kept.
        table.apply_ping_result(pending.clone(), true);
        assert!(table.contains(&head.id));
        assert!(!table.contains(&newcomer.id));

        // Dead head: evicted, newcomer appended at the tail.
        let pending = match table.upsert(newcomer) {
            UpsertOutcome::Full(p) => p,
            other => panic!("expected full bucket, got {:?}", other),
        };
        table.apply_ping_result(pending, false);
        assert!(!table.contains(&head.id));
        assert!(table.contains(&newcomer.id));
        assert_eq!(table.total_nodes(), MAX_CONTACTS_IN_BUCKET);
    }

    #[test]
    fn closest_sorts_by_distance_with_exclusion() {
        let mut table = RoutingTable::new(origin());
        let near = peer_with_prefix(0x01, 1);
        let mid = peer_with_prefix(0x10, 2);
        let far = peer_with_prefix(0x80, 3);
        for peer in [far, near, mid] {
            table.upsert(peer);
        }

        let target: Key = [0u8; NODE_HASH_LEN];
        let found = table.closest(&target, MAX_CONTACTS_IN_BUCKET, &[]);
        assert_eq!(
            found.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![near.id, mid.id, far.id]
        );

        let found = table.closest(&target, MAX_CONTACTS_IN_BUCKET, &[mid.id]);
        assert_eq!(
            found.iter().map(|p| p.id).collect::<Vec<_>>(),
            vec![near.id, far.id]
        );

        let found = table.closest(&target, 1, &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, near.id);
    }

    #[test]
    fn closest_breaks_distance_ties_lexicographically() {
        // Two ids equidistant from the all-zero target cannot exist under
        // XOR, so exercise the tie-break through equal prefixes instead:
        // identical first bytes, ordering decided by the raw id comparison
        // folded into the sort.
        let mut table = RoutingTable::new(origin());
        let a = peer_with_prefix(0x40, 2);
        let b = peer_with_prefix(0x40, 1);
        table.upsert(a);
        table.upsert(b);

        let target: Key = [0u8; NODE_HASH_LEN];
        let found = table.closest(&target, 2, &[]);
        assert_eq!(found[0].id, b.id);
        assert_eq!(found[1].id, a.id);
    }

    #[test]
    fn closeness_score_counts_closer_nodes() {
        let mut table = RoutingTable::new(origin());
        let mut key = [0u8; NODE_HASH_LEN];
        key[0] = 0x80;

        assert_eq!(table.closeness_score(&key), 0);

        // Closer to the key than the origin is.
        table.upsert(peer_with_prefix(0x80, 1));
        // Same bucket but no closer than the origin.
        table.upsert(peer_with_prefix(0xC0, 2));
        assert_eq!(table.closeness_score(&key), 1);
    }

    #[test]
    fn random_id_lands_in_requested_bucket() {
        let table = RoutingTable::new(origin());
        for idx in [0usize, 7, 63, KEY_BIT_SIZE - 1] {
            let id = table.random_id_in_bucket(idx);
            assert_eq!(bucket_index(&table.origin().id, &id), Some(idx));
        }
    }

    #[test]
    fn stale_buckets_reset_on_activity() {
        let mut table = RoutingTable::new(origin());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            table.stale_buckets(Duration::from_millis(10)).len(),
            KEY_BIT_SIZE
        );
        table.reset_refresh_time(5);
        let stale = table.stale_buckets(Duration::from_millis(10));
        assert_eq!(stale.len(), KEY_BIT_SIZE - 1);
        assert!(!stale.contains(&5));
        assert!(table.stale_buckets(Duration::from_secs(3600)).is_empty());
    }
}
