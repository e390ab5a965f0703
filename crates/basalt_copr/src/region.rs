//! Region and replica descriptors plus the region-cache seam.
//!
//! The cache itself lives outside this crate; the dispatcher only needs the
//! three queries below. Implementations must be safe for concurrent use
//! because every worker rebuild may hit the cache in parallel.

use async_trait::async_trait;
use bytes::Bytes;

use crate::backoff::Backoffer;
use crate::error::CoprError;
use crate::range::KeyRanges;

pub type RegionId = u64;
pub type StoreId = u64;

/// Immutable snapshot of a region's identity: id plus the epoch pair that
/// invalidates cached routing when the region splits, merges, or moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionVerId {
    pub id: RegionId,
    pub conf_ver: u64,
    pub ver: u64,
}

impl RegionVerId {
    pub fn new(id: RegionId, conf_ver: u64, ver: u64) -> Self {
        Self { id, conf_ver, ver }
    }
}

impl std::fmt::Display for RegionVerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.id, self.conf_ver, self.ver)
    }
}

/// Region boundary metadata captured alongside the identity snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegionMeta {
    pub start_key: Bytes,
    pub end_key: Bytes,
}

/// A physical replica node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Store {
    pub id: StoreId,
    pub addr: String,
}

impl Store {
    pub fn new(id: StoreId, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
        }
    }
}

/// Routing context for one region: which replica the cache picked and how to
/// reach it.
#[derive(Clone, Debug)]
pub struct RpcContext {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    pub store: Store,
}

impl RpcContext {
    pub fn addr(&self) -> &str {
        &self.store.addr
    }
}

/// One region's share of a batch: identity, boundary metadata, the user
/// ranges that fall inside it, and the replica stores that can serve it.
/// `all_stores[0]` is the home store.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    pub ranges: KeyRanges,
    pub all_stores: Vec<StoreId>,
}

impl RegionInfo {
    /// The region's home store, i.e. the primary analytical replica.
    pub fn home_store(&self) -> StoreId {
        self.all_stores[0]
    }
}

/// Output pair of a range split: a region and the input ranges inside it.
#[derive(Clone, Debug)]
pub struct LocatedRanges {
    pub region: RegionVerId,
    pub meta: RegionMeta,
    pub ranges: KeyRanges,
}

/// Replica class a read is routed to. Batch coprocessor reads target the
/// analytical column replicas; the tag travels in the store request so the
/// receiving node routes it to that engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaClass {
    Analytical,
}

/// Region cache seam.
#[async_trait]
pub trait RegionCache: Send + Sync {
    /// Split `ranges` at region boundaries, returning one entry per region
    /// touched, in key order.
    async fn split_key_ranges(
        &self,
        bo: &mut Backoffer,
        ranges: &KeyRanges,
    ) -> Result<Vec<LocatedRanges>, CoprError>;

    /// Routing context of the analytical replica for `region`, or `None`
    /// when the cached snapshot no longer knows the region (stale cache;
    /// the caller should back off and rebuild).
    async fn analytical_rpc_context(
        &self,
        bo: &mut Backoffer,
        region: RegionVerId,
        leader_only: bool,
    ) -> Result<Option<RpcContext>, CoprError>;

    /// Every analytical store currently eligible to serve `region`, with
    /// `primary` first.
    fn all_analytical_stores(&self, region: RegionVerId, primary: &Store) -> Vec<StoreId>;
}
