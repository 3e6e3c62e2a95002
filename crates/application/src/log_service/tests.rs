use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tether_core::AppError;
use tether_domain::LogLine;

use crate::store_ports::StoreTable;
use crate::test_support::FakeKeyValueStore;

use super::{COUNTER_SORT_KEY, LogService, counter_key};

fn lines(messages: &[&str]) -> Vec<LogLine> {
    messages
        .iter()
        .enumerate()
        .map(|(offset, message)| LogLine {
            timestamp: 1_700_000_000_000 + offset as i64,
            message: (*message).to_owned(),
        })
        .collect()
}

fn numbered_lines(count: usize) -> Vec<LogLine> {
    (0..count)
        .map(|offset| LogLine {
            timestamp: 1_700_000_000_000 + offset as i64,
            message: format!("line {offset}"),
        })
        .collect()
}

#[tokio::test]
async fn sequential_batches_receive_consecutive_indices() {
    let service = LogService::new(FakeKeyValueStore::shared());

    let first = service
        .ingest_batch("exec-9", None, &lines(&["a", "b", "c"]))
        .await;
    assert!(first.is_ok());
    let first = first.unwrap_or_else(|_| unreachable!());
    assert_eq!(first.start_index, 1);
    assert_eq!(first.end_index(), 3);

    let second = service
        .ingest_batch("exec-9", None, &lines(&["d", "e"]))
        .await;
    assert!(second.is_ok());
    let second = second.unwrap_or_else(|_| unreachable!());
    assert_eq!(second.start_index, 4);
    assert_eq!(second.end_index(), 5);

    assert!(matches!(service.max_index("exec-9").await, Ok(5)));

    let entries = service.read_since("exec-9", 0).await;
    assert!(entries.is_ok());
    let entries = entries.unwrap_or_else(|_| unreachable!());
    let indices: Vec<i64> = entries.iter().map(|entry| entry.index).collect();
    let messages: Vec<&str> = entries.iter().map(|entry| entry.message.as_str()).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert_eq!(messages, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn concurrent_reservations_are_disjoint_and_gapless() {
    let service = Arc::new(LogService::new(FakeKeyValueStore::shared()));

    let mut handles = Vec::new();
    for count in 1..=8_i64 {
        let service = service.clone();
        handles.push(tokio::spawn(async move {
            service
                .reserve_range("exec-concurrent", count)
                .await
                .map(|start| (start, count))
        }));
    }

    let mut covered = BTreeSet::new();
    for handle in handles {
        let reserved = handle.await;
        assert!(matches!(reserved, Ok(Ok(_))));
        let (start, count) = reserved
            .ok()
            .and_then(Result::ok)
            .unwrap_or_else(|| unreachable!());
        for index in start..start + count {
            assert!(covered.insert(index), "index {index} reserved twice");
        }
    }

    let total: i64 = (1..=8).sum();
    assert_eq!(covered, (1..=total).collect::<BTreeSet<_>>());
    assert!(matches!(service.max_index("exec-concurrent").await, Ok(max) if max == total));
}

#[tokio::test]
async fn reads_skip_the_counter_sentinel_and_respect_cursor() {
    let store = FakeKeyValueStore::shared();
    let service = LogService::new(store.clone()).with_read_page_size(2);

    assert!(
        service
            .append_entries("s-1", 1, &numbered_lines(5))
            .await
            .is_ok()
    );
    assert!(service.reserve_range("s-1", 5).await.is_ok());
    assert!(store.raw_item(&counter_key("s-1")).await.is_some());

    let all = service.read_since("s-1", -10).await;
    assert!(all.is_ok());
    let all = all.unwrap_or_else(|_| unreachable!());
    assert_eq!(all.len(), 5);
    assert!(all.iter().all(|entry| entry.index != COUNTER_SORT_KEY));

    let tail = service.read_since("s-1", 3).await;
    assert_eq!(
        tail.map(|entries| entries.iter().map(|entry| entry.index).collect::<Vec<_>>())
            .ok(),
        Some(vec![4, 5])
    );

    let page = service.read_page("s-1", 1, 3).await;
    assert_eq!(
        page.map(|entries| entries.iter().map(|entry| entry.index).collect::<Vec<_>>())
            .ok(),
        Some(vec![2, 3, 4])
    );
}

#[tokio::test]
async fn unknown_execution_reads_empty_and_is_not_materialized() {
    let service = LogService::new(FakeKeyValueStore::shared());

    assert!(matches!(service.read_since("missing", 0).await, Ok(entries) if entries.is_empty()));
    assert!(matches!(service.max_index("missing").await, Ok(0)));
    assert!(matches!(
        service.is_materialized("missing").await,
        Ok(false)
    ));
}

#[tokio::test]
async fn failed_chunk_names_its_offset() {
    let store = FakeKeyValueStore::shared();
    store.fail_batch_call(1).await;
    let service = LogService::new(store);

    let result = service
        .append_entries("exec-chunks", 1, &numbered_lines(60))
        .await;
    assert!(matches!(result, Err(AppError::Internal(message)) if message.contains("offset 25")));

    let written = service.read_since("exec-chunks", 0).await;
    assert_eq!(written.map(|entries| entries.len()).ok(), Some(25));
}

#[tokio::test]
async fn expire_all_reports_partial_failure() {
    let store = FakeKeyValueStore::shared();
    let service = LogService::new(store.clone());

    let ingested = service
        .ingest_batch("exec-retention", None, &numbered_lines(30))
        .await;
    assert!(ingested.is_ok());

    store.fail_batch_call(3).await;
    let deadline = Utc::now() + Duration::days(7);
    let report = service.expire_all("exec-retention", deadline).await;
    assert!(report.is_ok());
    let report = report.unwrap_or_else(|_| unreachable!());

    assert!(!report.is_complete());
    assert_eq!(report.failed_batches.len(), 1);
    assert_eq!(report.failed_batches[0].offset, 25);
    assert_eq!(report.stamped, 25);

    let counter = store.raw_item(&counter_key("exec-retention")).await;
    assert_eq!(counter.and_then(|item| item.expires_at), Some(deadline));
}

#[tokio::test]
async fn redelivered_batch_reuses_original_indices() {
    let service = LogService::new(FakeKeyValueStore::shared());
    let batch = lines(&["compile", "link"]);

    let first = service
        .ingest_batch("exec-replay", Some("batch-1"), &batch)
        .await;
    assert!(first.is_ok());
    let first = first.unwrap_or_else(|_| unreachable!());
    assert!(!first.replayed);

    let replay = service
        .ingest_batch("exec-replay", Some("batch-1"), &batch)
        .await;
    assert!(replay.is_ok());
    let replay = replay.unwrap_or_else(|_| unreachable!());
    assert!(replay.replayed);
    assert_eq!(replay.start_index, first.start_index);

    assert!(matches!(service.max_index("exec-replay").await, Ok(2)));

    let mismatched = service
        .ingest_batch("exec-replay", Some("batch-1"), &lines(&["compile"]))
        .await;
    assert!(matches!(mismatched, Err(AppError::Validation(_))));

    let next = service
        .ingest_batch("exec-replay", Some("batch-2"), &lines(&["test"]))
        .await;
    assert_eq!(next.map(|batch| batch.start_index).ok(), Some(3));
}

#[tokio::test]
async fn claim_lost_during_reservation_is_recorded_again() {
    let store = FakeKeyValueStore::shared();
    let service = LogService::new(store.clone());
    let batch = lines(&["fetch", "unpack", "install"]);

    store
        .expire_before_next_update(StoreTable::LogBatches)
        .await;
    let first = service
        .ingest_batch("exec-lost", Some("batch-1"), &batch)
        .await;
    assert!(first.is_ok());
    let first = first.unwrap_or_else(|_| unreachable!());
    assert_eq!((first.start_index, first.count), (1, 3));

    let replay = service
        .ingest_batch("exec-lost", Some("batch-1"), &batch)
        .await;
    assert!(matches!(replay, Ok(replay) if replay.replayed && replay.start_index == 1));
    assert!(matches!(service.max_index("exec-lost").await, Ok(3)));
}

#[tokio::test]
async fn invalid_batches_are_rejected() {
    let service = LogService::new(FakeKeyValueStore::shared());

    assert!(matches!(
        service.ingest_batch("exec-1", None, &[]).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        service.ingest_batch("", None, &lines(&["a"])).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        service.reserve_range("exec-1", 0).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        service.append_entries("exec-1", 0, &lines(&["a"])).await,
        Err(AppError::Validation(_))
    ));
    assert!(matches!(
        service.read_page("exec-1", 0, 0).await,
        Err(AppError::Validation(_))
    ));
}
