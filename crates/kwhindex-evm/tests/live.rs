mod common;

use std::sync::Arc;

use common::*;
use kwhindex_core::{cursor_key, CursorStore, IndexerConfig, ProgressTracker};
use kwhindex_evm::{Backfill, BackfillSettings, ContractDescriptor, LiveTail, RecordWriter};
use kwhindex_rpc::ChainGateway;
use kwhindex_storage::InMemoryStorage;

fn live_tail(chain: &Arc<MockChain>, store: &Arc<InMemoryStorage>) -> Arc<LiveTail> {
    let gateway: Arc<dyn ChainGateway> = chain.clone();
    let writer = Arc::new(RecordWriter::new(gateway.clone(), store.clone(), 31337));
    let settings = BackfillSettings::from(&IndexerConfig {
        start_block: Some(100),
        confirmations: 5,
        batch_size: 10,
        ..Default::default()
    });
    let backfill = Arc::new(Backfill::new(
        gateway.clone(),
        writer.clone(),
        ProgressTracker::new(store.clone()),
        settings,
    ));
    let token = ContractDescriptor::from_abi_json("KWHToken", TOKEN, TOKEN_ABI).unwrap();
    Arc::new(LiveTail::new(gateway, backfill, writer, vec![Arc::new(token)]))
}

#[tokio::test]
async fn overlapping_triggers_run_one_catch_up() {
    let chain = MockChain::new(130);
    let store = Arc::new(InMemoryStorage::new());
    let live = live_tail(&chain, &store);

    let gate = chain.gate.lock().await;
    let first = live.trigger_catch_up(131).expect("first trigger runs");
    assert!(live.is_syncing());
    for head in 132..140 {
        assert!(live.trigger_catch_up(head).is_none());
    }

    drop(gate);
    first.await.unwrap();

    assert!(!live.is_syncing());
    assert_eq!(chain.latest_calls(), 1);
    assert_eq!(store.get_cursor(&cursor_key(TOKEN)).await.unwrap(), Some(126));

    // The guard is released, so the next head schedules a new pass.
    let next = live.trigger_catch_up(140).expect("guard released");
    next.await.unwrap();
    assert_eq!(chain.latest_calls(), 2);
}

#[tokio::test]
async fn live_logs_are_stored_once() {
    let chain = MockChain::new(130);
    let store = Arc::new(InMemoryStorage::new());
    let live = live_tail(&chain, &store);

    let tasks = live.attach().await.unwrap();
    // two event fragments plus the new-block listener
    assert_eq!(tasks.len(), 3);
    assert_eq!(chain.log_subscription_count(), 2);

    let log = consumed(131, "0xcafe", 0, 42);
    chain.emit_log(&log);
    chain.emit_log(&log);

    assert!(wait_for(|| store.tx_count() == 1).await);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(store.tx_count(), 1);
    assert_eq!(store.event_count(), 1);

    for task in tasks {
        task.abort();
    }
}

#[tokio::test]
async fn new_head_triggers_backfill_of_missed_logs() {
    let chain = MockChain::new(130);
    let store = Arc::new(InMemoryStorage::new());
    let live = live_tail(&chain, &store);
    let tasks = live.attach().await.unwrap();

    // Delivered by neither subscription; only the catch-up finds it.
    chain.add_log(consumed(120, "0xmissed", 1, 7));
    chain.emit_head(131);

    assert!(wait_for(|| store.tx_count() == 1).await);
    assert!(wait_for(|| !live.is_syncing()).await);
    assert_eq!(store.get_cursor(&cursor_key(TOKEN)).await.unwrap(), Some(126));

    for task in tasks {
        task.abort();
    }
}
