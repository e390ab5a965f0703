//! Worker-side recovery: whole-batch rebuilds and stream failures.

mod common;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use basalt_copr::range::KeyRange;
use basalt_copr::{BatchReadRequest, CoprError, QueryVars};

use common::{MockRegionCache, MockSender, SendScript};

fn single_store_cache() -> MockRegionCache {
    let mut cache = MockRegionCache::new();
    cache.add_store(1);
    cache.add_region(10, b"a", b"", &[1]);
    cache
}

fn full_read() -> BatchReadRequest {
    BatchReadRequest {
        start_ts: 42,
        ranges: vec![KeyRange::new(b"a".to_vec(), b"z".to_vec())],
        ..Default::default()
    }
}

#[tokio::test]
async fn store_error_rebuilds_the_whole_batch() {
    let cache = Arc::new(single_store_cache());
    let sender = Arc::new(MockSender::new());
    sender.script(1, SendScript::Retry);
    sender.script(1, SendScript::Fragments(vec!["after-retry"]));
    let client = common::client(cache, sender.clone());

    let mut it = client
        .dispatch(
            CancellationToken::new(),
            full_read(),
            Arc::new(QueryVars::new()),
            None,
        )
        .await;

    let record = it.next().await.unwrap().expect("one record after rebuild");
    assert_eq!(record.data(), b"after-retry");
    assert_eq!(record.runtime_stats().callee_address, common::store_addr(1));
    assert!(it.next().await.unwrap().is_none());
    it.close().await.unwrap();

    // Both round trips carried the same region set: the rebuild re-expanded
    // the unioned ranges against an unchanged region map.
    let sent = sender.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].region_ids, vec![10]);
    assert_eq!(sent[1].region_ids, vec![10]);
}

#[tokio::test(start_paused = true)]
async fn recv_failure_surfaces_as_server_timeout() {
    let cache = Arc::new(single_store_cache());
    let sender = Arc::new(MockSender::new());
    sender.script(1, SendScript::RecvError(vec!["first"]));
    let client = common::client(cache, sender);

    let mut it = client
        .dispatch(
            CancellationToken::new(),
            full_read(),
            Arc::new(QueryVars::new()),
            None,
        )
        .await;

    let record = it.next().await.unwrap().expect("fragment before the failure");
    assert_eq!(record.data(), b"first");

    match it.next().await {
        Err(CoprError::ServerTimeout) => {}
        other => panic!("expected server timeout, got {other:?}"),
    }
    assert!(it.next().await.unwrap().is_none());
    it.close().await.unwrap();
}

#[tokio::test]
async fn stream_level_store_error_terminates_the_batch() {
    let cache = Arc::new(single_store_cache());
    let sender = Arc::new(MockSender::new());
    sender.script(1, SendScript::OtherError("region executor panicked"));
    let client = common::client(cache, sender);

    let mut it = client
        .dispatch(
            CancellationToken::new(),
            full_read(),
            Arc::new(QueryVars::new()),
            None,
        )
        .await;

    match it.next().await {
        Err(CoprError::Store { addr, msg }) => {
            assert_eq!(addr, common::store_addr(1));
            assert!(msg.contains("region executor panicked"));
        }
        other => panic!("expected store error, got {other:?}"),
    }
    assert!(it.next().await.unwrap().is_none());
    it.close().await.unwrap();
}
