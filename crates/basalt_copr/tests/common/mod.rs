//! Shared mocks for dispatcher integration tests: an in-memory region map
//! and a scripted sender.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use basalt_copr::backoff::Backoffer;
use basalt_copr::error::CoprError;
use basalt_copr::range::{KeyRange, KeyRanges};
use basalt_copr::region::{
    LocatedRanges, RegionCache, RegionId, RegionInfo, RegionMeta, RegionVerId, RpcContext, Store,
    StoreId,
};
use basalt_copr::rpc::{
    BatchCopStream, BatchResponse, BatchResponseStream, BatchSender, SendOutcome, StoreRequest,
    StreamError,
};
use basalt_copr::{BatchCopClient, CoprConfig, MemoryTracker, SnapshotVisibility};

pub fn store_addr(store_id: StoreId) -> String {
    format!("store-{store_id}.basalt:20170")
}

struct RegionDef {
    ver: RegionVerId,
    start: Bytes,
    end: Bytes,
    all_stores: Vec<StoreId>,
}

/// In-memory region map with optional one-shot staleness per region.
pub struct MockRegionCache {
    regions: Vec<RegionDef>,
    stores: HashMap<StoreId, Store>,
    missing_once: Mutex<HashSet<RegionId>>,
    missing_always: Mutex<HashSet<RegionId>>,
}

impl MockRegionCache {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            stores: HashMap::new(),
            missing_once: Mutex::new(HashSet::new()),
            missing_always: Mutex::new(HashSet::new()),
        }
    }

    pub fn add_store(&mut self, store_id: StoreId) {
        self.stores
            .insert(store_id, Store::new(store_id, store_addr(store_id)));
    }

    /// Regions must be added in key order; `end` empty means "to the end of
    /// the keyspace". `all_stores[0]` is the home store.
    pub fn add_region(&mut self, id: RegionId, start: &[u8], end: &[u8], all_stores: &[StoreId]) {
        self.regions.push(RegionDef {
            ver: RegionVerId::new(id, 1, 1),
            start: Bytes::copy_from_slice(start),
            end: Bytes::copy_from_slice(end),
            all_stores: all_stores.to_vec(),
        });
    }

    /// Make the next `analytical_rpc_context` call for `region` report a
    /// stale cache snapshot.
    pub fn miss_once(&self, region: RegionId) {
        self.missing_once.lock().unwrap().insert(region);
    }

    /// Make every `analytical_rpc_context` call for `region` report a stale
    /// snapshot, exhausting the build backoff.
    pub fn miss_always(&self, region: RegionId) {
        self.missing_always.lock().unwrap().insert(region);
    }

    fn def(&self, region: RegionVerId) -> Option<&RegionDef> {
        self.regions.iter().find(|def| def.ver.id == region.id)
    }
}

fn max_start(a: &Bytes, b: &Bytes) -> Bytes {
    if a >= b {
        a.clone()
    } else {
        b.clone()
    }
}

fn min_end(a: &Bytes, b: &Bytes) -> Bytes {
    if a.is_empty() {
        return b.clone();
    }
    if b.is_empty() {
        return a.clone();
    }
    if a <= b {
        a.clone()
    } else {
        b.clone()
    }
}

#[async_trait]
impl RegionCache for MockRegionCache {
    async fn split_key_ranges(
        &self,
        _bo: &mut Backoffer,
        ranges: &KeyRanges,
    ) -> Result<Vec<LocatedRanges>, CoprError> {
        let mut out = Vec::new();
        for def in &self.regions {
            let mut inside = Vec::new();
            for range in ranges.iter() {
                let start = max_start(&range.start, &def.start);
                let end = min_end(&range.end, &def.end);
                if end.is_empty() || start < end {
                    inside.push(KeyRange { start, end });
                }
            }
            if !inside.is_empty() {
                out.push(LocatedRanges {
                    region: def.ver,
                    meta: RegionMeta {
                        start_key: def.start.clone(),
                        end_key: def.end.clone(),
                    },
                    ranges: KeyRanges::new(inside),
                });
            }
        }
        Ok(out)
    }

    async fn analytical_rpc_context(
        &self,
        _bo: &mut Backoffer,
        region: RegionVerId,
        _leader_only: bool,
    ) -> Result<Option<RpcContext>, CoprError> {
        if self.missing_always.lock().unwrap().contains(&region.id) {
            return Ok(None);
        }
        if self.missing_once.lock().unwrap().remove(&region.id) {
            return Ok(None);
        }
        let Some(def) = self.def(region) else {
            return Ok(None);
        };
        let store = self.stores[&def.all_stores[0]].clone();
        Ok(Some(RpcContext {
            region: def.ver,
            meta: RegionMeta {
                start_key: def.start.clone(),
                end_key: def.end.clone(),
            },
            store,
        }))
    }

    fn all_analytical_stores(&self, region: RegionVerId, primary: &Store) -> Vec<StoreId> {
        let Some(def) = self.def(region) else {
            return vec![primary.id];
        };
        let mut stores = vec![primary.id];
        stores.extend(def.all_stores.iter().copied().filter(|id| *id != primary.id));
        stores
    }
}

/// What one scripted send should do.
pub enum SendScript {
    /// Stream the given payloads, then EOF.
    Fragments(Vec<&'static str>),
    /// Report a store-level failure; the dispatcher rebuilds the batch.
    Retry,
    /// Stream one fragment carrying a request-level error string.
    OtherError(&'static str),
    /// Stream the given payloads, then fail the recv.
    RecvError(Vec<&'static str>),
    /// Block inside `send` until the RPC cancel token fires.
    Hang,
}

/// One observed send, for coverage and fan-out assertions.
pub struct SentRequest {
    pub store_addr: String,
    pub region_ids: Vec<u64>,
    pub ranges: Vec<KeyRange>,
}

/// Sender whose behavior is scripted per store address, in send order.
pub struct MockSender {
    scripts: Mutex<HashMap<String, VecDeque<SendScript>>>,
    pub sent: Mutex<Vec<SentRequest>>,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, store_id: StoreId, script: SendScript) {
        self.scripts
            .lock()
            .unwrap()
            .entry(store_addr(store_id))
            .or_default()
            .push_back(script);
    }

    pub fn sent_to(&self, store_id: StoreId) -> usize {
        let addr = store_addr(store_id);
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|sent| sent.store_addr == addr)
            .count()
    }
}

enum Tail {
    Eof,
    RecvError,
}

struct ScriptedStream {
    fragments: VecDeque<BatchResponse>,
    tail: Tail,
}

#[async_trait]
impl BatchResponseStream for ScriptedStream {
    async fn recv(&mut self) -> Result<Option<BatchResponse>, StreamError> {
        if let Some(fragment) = self.fragments.pop_front() {
            return Ok(Some(fragment));
        }
        match self.tail {
            Tail::Eof => Ok(None),
            Tail::RecvError => Err(StreamError::Other(anyhow::anyhow!("connection reset"))),
        }
    }
}

fn data_fragment(payload: &str) -> BatchResponse {
    BatchResponse {
        data: Bytes::copy_from_slice(payload.as_bytes()),
        other_error: String::new(),
    }
}

fn stream(mut fragments: VecDeque<BatchResponse>, tail: Tail) -> BatchCopStream {
    let first = fragments.pop_front();
    BatchCopStream {
        first,
        inner: Box::new(ScriptedStream { fragments, tail }),
    }
}

#[async_trait]
impl BatchSender for MockSender {
    async fn send(
        &self,
        _bo: &mut Backoffer,
        ctx: &RpcContext,
        _regions: &[RegionInfo],
        req: StoreRequest,
        _timeout: std::time::Duration,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, CoprError> {
        self.sent.lock().unwrap().push(SentRequest {
            store_addr: ctx.store.addr.clone(),
            region_ids: req.body.regions.iter().map(|r| r.region_id).collect(),
            ranges: req
                .body
                .regions
                .iter()
                .flat_map(|r| r.ranges.iter().cloned())
                .collect(),
        });

        let script = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(ctx.store.addr.as_str())
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| panic!("no script for send to {}", ctx.store.addr));

        match script {
            SendScript::Fragments(payloads) => Ok(SendOutcome::Stream(stream(
                payloads.into_iter().map(data_fragment).collect(),
                Tail::Eof,
            ))),
            SendScript::Retry => Ok(SendOutcome::Retry),
            SendScript::OtherError(msg) => {
                let fragment = BatchResponse {
                    data: Bytes::new(),
                    other_error: msg.to_string(),
                };
                Ok(SendOutcome::Stream(stream(
                    VecDeque::from(vec![fragment]),
                    Tail::Eof,
                )))
            }
            SendScript::RecvError(payloads) => Ok(SendOutcome::Stream(stream(
                payloads.into_iter().map(data_fragment).collect(),
                Tail::RecvError,
            ))),
            SendScript::Hang => {
                cancel.cancelled().await;
                Err(CoprError::Other(anyhow::anyhow!("rpc cancelled")))
            }
        }
    }
}

pub struct AlwaysVisible;

impl SnapshotVisibility for AlwaysVisible {
    fn check_visibility(&self, _start_ts: u64) -> Result<(), CoprError> {
        Ok(())
    }
}

/// Memory tracker that just sums reported sizes.
#[derive(Default)]
pub struct SizeTracker(pub AtomicU64);

impl MemoryTracker for SizeTracker {
    fn consume(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }
}

pub fn client(cache: Arc<MockRegionCache>, sender: Arc<MockSender>) -> BatchCopClient {
    BatchCopClient::new(cache, sender, Arc::new(AlwaysVisible), CoprConfig::default())
}

/// Two stores, two regions, each region replicated on both stores.
pub fn two_store_cache() -> MockRegionCache {
    let mut cache = MockRegionCache::new();
    cache.add_store(1);
    cache.add_store(2);
    cache.add_region(10, b"a", b"m", &[1, 2]);
    cache.add_region(20, b"m", b"", &[2, 1]);
    cache
}
