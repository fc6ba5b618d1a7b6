//! # Routing table
//!
//! A per-address-family k-table over the 256-bit id space. Buckets are an
//! ordered, non-overlapping partition of `[0, 2^256)`; each holds up to
//! [`K`] live entries plus a replacement cache of the same size. Only the
//! home bucket (the one covering the local id) and buckets shallower than
//! [`SPLIT_DEPTH`] may split when full.
//!
//! Liveness: an entry becomes `reachable` on its first response and is
//! considered dead after three consecutive timeouts without an intervening
//! response. Dead entries are swapped for the youngest live replacement the
//! next time the bucket is touched by an insertion.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::identity::{closer_to, Id, ID_BITS};

/// Max entries per bucket (Kademlia k).
pub const K: usize = 8;

/// Buckets shallower than this may split even when not home.
const SPLIT_DEPTH: usize = 5;

/// Consecutive timeouts after which an entry is considered dead.
const MAX_FAILURES: u32 = 3;

/// A non-home bucket idle longer than this gets a random-id refresh probe.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Address family of a socket address, used to keep one table per family.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum Network {
    V4,
    V6,
}

impl Network {
    pub fn of(addr: &SocketAddr) -> Network {
        if addr.is_ipv4() {
            Network::V4
        } else {
            Network::V6
        }
    }

    pub fn can_use(&self, addr: &SocketAddr) -> bool {
        Network::of(addr) == *self
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Network::V4 => "IPv4",
            Network::V6 => "IPv6",
        })
    }
}

/// A known node plus its liveness bookkeeping.
#[derive(Clone)]
pub struct NodeInfo {
    pub id: Id,
    pub addr: SocketAddr,
    pub version: i64,
    last_seen: Option<Instant>,
    last_send: Option<Instant>,
    failed_requests: u32,
    reachable: bool,
}

impl NodeInfo {
    pub fn new(id: Id, addr: SocketAddr) -> NodeInfo {
        NodeInfo {
            id,
            addr,
            version: 0,
            last_seen: None,
            last_send: None,
            failed_requests: 0,
            reachable: false,
        }
    }

    pub fn with_version(mut self, version: i64) -> NodeInfo {
        self.version = version;
        self
    }

    pub fn on_response(&mut self, now: Instant) {
        self.last_seen = Some(now);
        self.failed_requests = 0;
        self.reachable = true;
    }

    pub fn on_send(&mut self, now: Instant) {
        self.last_send = Some(now);
    }

    pub fn on_timeout(&mut self) {
        self.failed_requests = self.failed_requests.saturating_add(1);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn is_dead(&self) -> bool {
        self.failed_requests >= MAX_FAILURES
    }

    /// Live enough to be handed out in lookups and responses.
    pub fn is_eligible(&self) -> bool {
        !self.is_dead()
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.last_seen
    }

    pub fn failed_requests(&self) -> u32 {
        self.failed_requests
    }
}

impl PartialEq for NodeInfo {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.addr == other.addr
    }
}

impl Eq for NodeInfo {}

impl std::fmt::Debug for NodeInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NodeInfo({}…@{}, failed={}, reachable={})",
            &self.id.to_hex()[..12],
            self.addr,
            self.failed_requests,
            self.reachable
        )
    }
}

/// A contiguous range of the id space: the first `depth` bits of `id`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Prefix {
    id: Id,
    depth: usize,
}

impl Prefix {
    /// The whole id space.
    pub fn root() -> Prefix {
        Prefix {
            id: Id::MIN,
            depth: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn covers(&self, id: &Id) -> bool {
        self.id.first_different_bit(id) >= self.depth
    }

    /// First id in the range.
    pub fn first(&self) -> Id {
        self.id
    }

    /// Last id in the range (suffix bits all ones).
    pub fn last(&self) -> Id {
        let mut bytes = *self.id.as_bytes();
        for bit in self.depth..ID_BITS {
            bytes[bit / 8] |= 0x80 >> (bit % 8);
        }
        Id::from_bytes(bytes)
    }

    /// Split into the two child ranges on the next bit.
    pub fn split(&self) -> (Prefix, Prefix) {
        debug_assert!(self.is_splittable());
        let low = Prefix {
            id: self.id,
            depth: self.depth + 1,
        };
        let high = Prefix {
            id: self.id.with_bit(self.depth, true),
            depth: self.depth + 1,
        };
        (low, high)
    }

    pub fn is_splittable(&self) -> bool {
        self.depth < ID_BITS - 1
    }

    /// Uniform random id inside this range.
    pub fn random_id(&self) -> Id {
        let random = Id::random();
        let mut bytes = *self.id.as_bytes();
        for bit in self.depth..ID_BITS {
            if random.bit(bit) {
                bytes[bit / 8] |= 0x80 >> (bit % 8);
            }
        }
        Id::from_bytes(bytes)
    }
}

impl std::fmt::Display for Prefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}…/{}", &self.id.to_hex()[..8], self.depth)
    }
}

/// One bucket: up to [`K`] main entries plus a replacement cache.
pub struct Bucket {
    prefix: Prefix,
    entries: Vec<NodeInfo>,
    replacements: Vec<NodeInfo>,
    last_refresh: Instant,
}

impl Bucket {
    fn new(prefix: Prefix, now: Instant) -> Bucket {
        Bucket {
            prefix,
            entries: Vec::new(),
            replacements: Vec::new(),
            last_refresh: now,
        }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn entries(&self) -> &[NodeInfo] {
        &self.entries
    }

    pub fn replacements(&self) -> &[NodeInfo] {
        &self.replacements
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= K
    }

    fn find_mut(&mut self, id: &Id) -> Option<&mut NodeInfo> {
        self.entries
            .iter_mut()
            .chain(self.replacements.iter_mut())
            .find(|e| e.id == *id)
    }

    /// Swap dead main entries for the youngest live replacements.
    fn promote_replacements(&mut self) {
        while let Some(dead_pos) = self.entries.iter().position(|e| e.is_dead()) {
            let Some(replacement_pos) = self.replacements.iter().rposition(|r| !r.is_dead()) else {
                break;
            };
            let replacement = self.replacements.remove(replacement_pos);
            let dead = std::mem::replace(&mut self.entries[dead_pos], replacement);
            debug!(evicted = %dead.id, promoted = %self.entries[dead_pos].id, "bucket eviction");
        }
    }

    fn put_replacement(&mut self, node: NodeInfo) {
        if let Some(existing) = self.replacements.iter_mut().find(|r| r.id == node.id) {
            existing.addr = node.addr;
            return;
        }
        if self.replacements.iter().any(|r| r.addr == node.addr) {
            return;
        }
        if self.replacements.len() >= K {
            self.replacements.remove(0);
        }
        self.replacements.push(node);
    }

    fn mark_refreshed(&mut self, now: Instant) {
        self.last_refresh = now;
    }

    fn needs_refresh(&self, now: Instant) -> bool {
        now.duration_since(self.last_refresh) >= BUCKET_REFRESH_INTERVAL
    }
}

/// Outcome of an insertion attempt, mostly for logs and tests.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Refreshed,
    Inserted,
    Replacement,
    Split,
    Rejected,
}

/// The bucketed table itself. Single-threaded: owned and mutated only by
/// the network actor.
pub struct RoutingTable {
    local_id: Id,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> RoutingTable {
        RoutingTable {
            local_id,
            buckets: vec![Bucket::new(Prefix::root(), Instant::now())],
        }
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Total number of main entries.
    pub fn size(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.len()).sum()
    }

    fn bucket_index_of(&self, id: &Id) -> usize {
        // Coverage is complete and ordered, so the bucket is the last one
        // whose first id is <= the target.
        let idx = self.buckets.partition_point(|b| b.prefix.first() <= *id);
        idx.saturating_sub(1)
    }

    fn bucket_of_mut(&mut self, id: &Id) -> &mut Bucket {
        let idx = self.bucket_index_of(id);
        &mut self.buckets[idx]
    }

    /// Home bucket: the one covering the local id.
    pub fn home_bucket(&self) -> &Bucket {
        &self.buckets[self.bucket_index_of(&self.local_id)]
    }

    fn is_home_eligible(&self, bucket: &Bucket) -> bool {
        bucket.prefix.covers(&self.local_id) || bucket.prefix.depth() < SPLIT_DEPTH
    }

    /// Insert or refresh a node, splitting the covering bucket when allowed.
    pub fn insert(&mut self, node: NodeInfo) -> InsertOutcome {
        if node.id == self.local_id {
            return InsertOutcome::Rejected;
        }

        loop {
            let idx = self.bucket_index_of(&node.id);
            let home_eligible = self.is_home_eligible(&self.buckets[idx]);
            let bucket = &mut self.buckets[idx];

            if let Some(existing) = bucket.find_mut(&node.id) {
                existing.addr = node.addr;
                if node.version != 0 {
                    existing.version = node.version;
                }
                existing.last_seen = Some(Instant::now());
                existing.failed_requests = 0;
                return InsertOutcome::Refreshed;
            }

            // One entry per (ip, port) within the bucket.
            if bucket.entries.iter().any(|e| e.addr == node.addr) {
                return InsertOutcome::Rejected;
            }

            bucket.promote_replacements();

            if !bucket.is_full() {
                bucket.entries.push(node);
                return InsertOutcome::Inserted;
            }

            if home_eligible && bucket.prefix.is_splittable() {
                self.split_bucket(idx);
                continue;
            }

            bucket.put_replacement(node);
            return InsertOutcome::Replacement;
        }
    }

    fn split_bucket(&mut self, idx: usize) {
        let now = Instant::now();
        let old = self.buckets.remove(idx);
        let (low_prefix, high_prefix) = old.prefix.split();
        let mut low = Bucket::new(low_prefix, now);
        let mut high = Bucket::new(high_prefix, now);
        low.last_refresh = old.last_refresh;
        high.last_refresh = old.last_refresh;

        for entry in old.entries {
            if high.prefix.covers(&entry.id) {
                high.entries.push(entry);
            } else {
                low.entries.push(entry);
            }
        }
        for entry in old.replacements {
            if high.prefix.covers(&entry.id) {
                high.replacements.push(entry);
            } else {
                low.replacements.push(entry);
            }
        }

        debug!(low = %low.prefix, high = %high.prefix, "bucket split");
        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    /// A response arrived from `id`; refresh its liveness.
    pub fn on_response(&mut self, id: &Id) {
        let now = Instant::now();
        if let Some(entry) = self.bucket_of_mut(id).find_mut(id) {
            entry.on_response(now);
        }
    }

    /// A request was sent to `id`.
    pub fn on_send(&mut self, id: &Id) {
        let now = Instant::now();
        if let Some(entry) = self.bucket_of_mut(id).find_mut(id) {
            entry.on_send(now);
        }
    }

    /// A request to `id` timed out.
    pub fn on_timeout(&mut self, id: &Id) {
        if let Some(entry) = self.bucket_of_mut(id).find_mut(id) {
            entry.on_timeout();
        }
    }

    /// Up to `k` live nodes ordered by distance to `target`, preferring
    /// entries that have actually responded over merely-known ones.
    pub fn closest(&self, target: &Id, k: usize) -> Vec<NodeInfo> {
        let mut reachable: Vec<&NodeInfo> = Vec::new();
        let mut known: Vec<&NodeInfo> = Vec::new();
        for bucket in &self.buckets {
            for entry in &bucket.entries {
                if !entry.is_eligible() {
                    continue;
                }
                if entry.is_reachable() {
                    reachable.push(entry);
                } else {
                    known.push(entry);
                }
            }
        }
        reachable.sort_by(|a, b| closer_to(target, &a.id, &b.id));
        known.sort_by(|a, b| closer_to(target, &a.id, &b.id));

        let mut result: Vec<NodeInfo> = reachable.into_iter().take(k).cloned().collect();
        if result.len() < k {
            let missing = k - result.len();
            result.extend(known.into_iter().take(missing).cloned());
            result.sort_by(|a, b| closer_to(target, &a.id, &b.id));
        }
        result
    }

    /// Look up a single known node.
    pub fn get(&self, id: &Id) -> Option<&NodeInfo> {
        let idx = self.bucket_index_of(id);
        self.buckets[idx].entries.iter().find(|e| e.id == *id)
    }

    /// Random probe targets for every stale non-home bucket.
    pub fn refresh_targets(&self, now: Instant) -> Vec<Id> {
        self.buckets
            .iter()
            .filter(|b| !b.prefix.covers(&self.local_id))
            .filter(|b| b.needs_refresh(now))
            .map(|b| b.prefix.random_id())
            .collect()
    }

    /// One probe target per bucket, used by the bootstrap fill stage.
    pub fn all_bucket_targets(&self) -> Vec<Id> {
        self.buckets.iter().map(|b| b.prefix.random_id()).collect()
    }

    /// Mark the bucket covering `id` as freshly probed.
    pub fn mark_refreshed(&mut self, id: &Id) {
        let now = Instant::now();
        self.bucket_of_mut(id).mark_refreshed(now);
    }

    /// Snapshot of all main entries, for persistence and diagnostics.
    pub fn dump(&self) -> Vec<NodeInfo> {
        self.buckets
            .iter()
            .flat_map(|b| b.entries.iter().cloned())
            .collect()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("local_id", &self.local_id)
            .field("buckets", &self.buckets.len())
            .field("entries", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(n: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 20000 + n)
    }

    fn node(id: Id, n: u16) -> NodeInfo {
        NodeInfo::new(id, addr(n))
    }

    /// Buckets must partition the id space exactly.
    fn assert_partition(table: &RoutingTable) {
        let buckets = table.buckets();
        assert_eq!(buckets[0].prefix().first(), Id::MIN);
        assert_eq!(buckets[buckets.len() - 1].prefix().last(), Id::MAX);
        for pair in buckets.windows(2) {
            let prev_last = *pair[0].prefix().last().as_bytes();
            let next_first = *pair[1].prefix().first().as_bytes();
            // next_first == prev_last + 1
            let mut incremented = prev_last;
            for byte in incremented.iter_mut().rev() {
                let (v, carry) = byte.overflowing_add(1);
                *byte = v;
                if !carry {
                    break;
                }
            }
            assert_eq!(incremented, next_first);
        }
    }

    #[test]
    fn prefix_cover_and_bounds() {
        let root = Prefix::root();
        assert!(root.covers(&Id::random()));
        assert_eq!(root.first(), Id::MIN);
        assert_eq!(root.last(), Id::MAX);

        let (low, high) = root.split();
        assert!(low.covers(&Id::MIN));
        assert!(high.covers(&Id::MAX));
        assert!(!low.covers(&Id::MAX));

        for _ in 0..32 {
            let id = high.random_id();
            assert!(high.covers(&id));
        }
    }

    #[test]
    fn insert_and_refresh() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        let id = Id::random();
        assert_eq!(table.insert(node(id, 1)), InsertOutcome::Inserted);
        assert_eq!(table.insert(node(id, 1)), InsertOutcome::Refreshed);
        assert_eq!(table.size(), 1);

        // Own id is never inserted.
        assert_eq!(table.insert(node(local, 2)), InsertOutcome::Rejected);
    }

    #[test]
    fn duplicate_address_rejected() {
        let local = Id::MIN;
        let mut table = RoutingTable::new(local);
        assert_eq!(table.insert(node(Id::random(), 7)), InsertOutcome::Inserted);
        // Same (ip, port), different id.
        assert_eq!(table.insert(node(Id::random(), 7)), InsertOutcome::Rejected);
    }

    #[test]
    fn home_bucket_splits_when_full() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        for n in 0..256u16 {
            table.insert(node(Id::random(), n));
        }

        assert!(table.bucket_count() > 1, "root bucket should have split");
        assert_partition(&table);
        for bucket in table.buckets() {
            assert!(bucket.entries().len() <= K);
            assert!(bucket.replacements().len() <= K);
        }
    }

    #[test]
    fn ids_appear_once() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        let mut ids = Vec::new();
        for n in 0..128u16 {
            let id = Id::random();
            ids.push(id);
            table.insert(node(id, n));
        }
        let mut seen = std::collections::HashSet::new();
        for bucket in table.buckets() {
            for entry in bucket.entries().iter().chain(bucket.replacements()) {
                assert!(seen.insert(entry.id), "{} appears twice", entry.id);
            }
        }
    }

    #[test]
    fn dead_entry_replaced_from_cache() {
        // Deep shared prefix so the bucket is not home-eligible and fills up.
        let local = Id::MIN;
        let mut table = RoutingTable::new(local);

        // Ids with the top bit set land away from home once the table splits.
        let mut far_ids = Vec::new();
        for n in 0..(K as u16 + 4) {
            let id = Id::random().with_bit(0, true);
            far_ids.push(id);
            table.insert(node(id, 100 + n));
        }
        // Force splits so the far bucket separates from home and fills.
        for n in 0..64u16 {
            table.insert(node(Id::random(), 300 + n));
        }

        // Pick a far id that sits in a full bucket with replacements.
        let full_idx = table.bucket_index_of(&far_ids[0]);
        if table.buckets[full_idx].replacements.is_empty() {
            // Layout is random; nothing to assert this round.
            return;
        }
        let victim = table.buckets[full_idx].entries[0].id;
        let replacement = *table.buckets[full_idx]
            .replacements
            .last()
            .map(|r| &r.id)
            .unwrap();

        for _ in 0..MAX_FAILURES {
            table.on_timeout(&victim);
        }
        // Next insertion into that bucket promotes the replacement.
        let probe = table.buckets[full_idx].prefix.random_id();
        table.insert(node(probe, 999));

        let bucket = &table.buckets[full_idx];
        assert!(bucket.entries.iter().all(|e| e.id != victim));
        assert!(bucket.entries.iter().any(|e| e.id == replacement));
    }

    #[test]
    fn closest_prefers_reachable() {
        let local = Id::MIN;
        let mut table = RoutingTable::new(local);
        let target = Id::random();

        let responded = Id::random();
        table.insert(node(responded, 1));
        table.on_response(&responded);

        for n in 2..6u16 {
            table.insert(node(Id::random(), n));
        }

        let closest = table.closest(&target, 3);
        assert!(closest.iter().any(|n| n.id == responded));
        // Ordered by distance.
        for pair in closest.windows(2) {
            assert_ne!(
                closer_to(&target, &pair[1].id, &pair[0].id),
                std::cmp::Ordering::Less
            );
        }
    }

    #[test]
    fn liveness_counters() {
        let mut info = node(Id::random(), 1);
        assert!(!info.is_reachable());
        info.on_timeout();
        info.on_timeout();
        assert!(!info.is_dead());
        info.on_response(Instant::now());
        assert!(info.is_reachable());
        assert_eq!(info.failed_requests(), 0);
        for _ in 0..MAX_FAILURES {
            info.on_timeout();
        }
        assert!(info.is_dead());
    }

    #[test]
    fn refresh_targets_cover_stale_buckets() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        for n in 0..128u16 {
            table.insert(node(Id::random(), n));
        }
        // Nothing stale right after creation.
        assert!(table.refresh_targets(Instant::now()).is_empty());

        let later = Instant::now() + BUCKET_REFRESH_INTERVAL + Duration::from_secs(1);
        let targets = table.refresh_targets(later);
        let non_home = table
            .buckets()
            .iter()
            .filter(|b| !b.prefix().covers(&local))
            .count();
        assert_eq!(targets.len(), non_home);

        if let Some(first) = targets.first() {
            table.mark_refreshed(first);
            let again = table.refresh_targets(later);
            assert_eq!(again.len(), non_home.saturating_sub(1));
        }
    }
}
