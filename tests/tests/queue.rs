//! Command-queue contract tests. Everything here drives the `CmdQueue`
//! trait so both back-ends must pass identically.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use libcanopy::cloud::cmdqueue::{CancelOutcome, CmdQueue, CmdState, MemQueue};
use libcanopy::cloud::dbqueue::DbQueue;

const RETENTION: usize = 2;

async fn mem_queue() -> Arc<dyn CmdQueue> {
    Arc::new(MemQueue::new(RETENTION))
}

async fn db_queue(dir: &tempfile::TempDir) -> Arc<dyn CmdQueue> {
    let db = libsql::Builder::new_local(dir.path().join("cmds.db"))
        .build()
        .await
        .expect("open command database");
    Arc::new(
        DbQueue::open(&db, Uuid::new_v4(), RETENTION)
            .await
            .expect("open queue"),
    )
}

async fn ids_are_monotone(queue: Arc<dyn CmdQueue>) {
    let first = queue.submit(json!({"n": 1})).await.unwrap();
    let second = queue.submit(json!({"n": 2})).await.unwrap();
    let third = queue.submit(json!({"n": 3})).await.unwrap();
    assert!(first < second && second < third);
}

async fn fetch_transitions_and_orders(queue: Arc<dyn CmdQueue>) {
    for n in 1..=3 {
        queue.submit(json!({ "n": n })).await.unwrap();
    }

    let batch = queue.fetch(0, 2, false).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert!(batch[0].id < batch[1].id);
    for command in &batch {
        assert_eq!(command.state, CmdState::Work);
        assert!(command.sent.is_some());
    }

    // Continuing from the last id yields the remainder, then nothing.
    let rest = queue.fetch(batch[1].id, 10, false).await.unwrap();
    assert_eq!(rest.len(), 1);
    let empty = queue.fetch(rest[0].id, 10, false).await.unwrap();
    assert!(empty.is_empty());

    // Re-fetching from zero re-offers unfinished WORK commands.
    let again = queue.fetch(0, 10, false).await.unwrap();
    assert_eq!(again.len(), 3);
}

async fn blocking_fetch_waits_for_submit(queue: Arc<dyn CmdQueue>) {
    let waiter = Arc::clone(&queue);
    let handle = tokio::spawn(async move { waiter.fetch(0, 1, true).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let id = queue.submit(json!({"wake": true})).await.unwrap();

    let fetched = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("blocked fetch should wake")
        .unwrap()
        .unwrap();
    assert_eq!(fetched.len(), 1);
    assert_eq!(fetched[0].id, id);
}

async fn complete_stores_response_once(queue: Arc<dyn CmdQueue>) {
    let id = queue.submit(json!({"op": "x"})).await.unwrap();
    queue.fetch(0, 1, false).await.unwrap();

    let done = queue.complete(id, json!({"code": "OK"})).await.unwrap();
    let done = done.expect("first completion returns the command");
    assert_eq!(done.state, CmdState::Done);
    assert_eq!(done.query, json!({"op": "x"}));

    // Duplicate completions are logged, not re-applied.
    let duplicate = queue.complete(id, json!({"code": "OK2"})).await.unwrap();
    assert!(duplicate.is_none());

    let status = queue.status(id).await.unwrap().unwrap();
    assert_eq!(status.state, CmdState::Done);
    assert_eq!(status.response, Some(json!({"code": "OK"})));
    assert!(status.done.is_some());
}

async fn cancel_depends_on_state(queue: Arc<dyn CmdQueue>) {
    // ENQD: cancels cleanly.
    let enqd = queue.submit(json!({"n": 1})).await.unwrap();
    assert_eq!(
        queue.cancel(enqd).await.unwrap(),
        CancelOutcome::Canceled
    );
    assert_eq!(
        queue.status(enqd).await.unwrap().unwrap().state,
        CmdState::Cncl
    );

    // WORK: stays WORK but is hidden from future fetches.
    let work = queue.submit(json!({"n": 2})).await.unwrap();
    queue.fetch(enqd, 1, false).await.unwrap();
    assert_eq!(
        queue.cancel(work).await.unwrap(),
        CancelOutcome::InProgress
    );
    assert_eq!(
        queue.status(work).await.unwrap().unwrap().state,
        CmdState::Work
    );
    assert!(queue.fetch(0, 10, false).await.unwrap().is_empty());

    // A hidden command can still be completed by id.
    let done = queue.complete(work, json!({"late": true})).await.unwrap();
    assert!(done.is_some());
    assert_eq!(
        queue.cancel(work).await.unwrap(),
        CancelOutcome::AlreadyDone
    );

    // Unknown ids.
    assert_eq!(queue.cancel(9999).await.unwrap(), CancelOutcome::Unknown);
    assert!(queue.status(9999).await.unwrap().is_none());
}

async fn gc_trims_past_retention(queue: Arc<dyn CmdQueue>) {
    let mut ids = Vec::new();
    for n in 1..=5 {
        ids.push(queue.submit(json!({ "n": n })).await.unwrap());
    }
    queue.fetch(0, 10, false).await.unwrap();
    for id in &ids {
        queue.complete(*id, json!({"ok": true})).await.unwrap();
    }

    let collected = queue.gc().await.unwrap();
    assert_eq!(collected, ids.len() - RETENTION);

    // Oldest completions are gone, newest survive.
    assert!(queue.status(ids[0]).await.unwrap().is_none());
    assert!(queue.status(*ids.last().unwrap()).await.unwrap().is_some());
}

macro_rules! queue_contract_tests {
    ($($name:ident),+ $(,)?) => {
        $(
            mod $name {
                use super::*;

                #[tokio::test]
                async fn memory() {
                    $name(mem_queue().await).await;
                }

                #[tokio::test]
                async fn database() {
                    let dir = tempfile::tempdir().unwrap();
                    $name(db_queue(&dir).await).await;
                }
            }
        )+
    };
}

queue_contract_tests!(
    ids_are_monotone,
    fetch_transitions_and_orders,
    blocking_fetch_waits_for_submit,
    complete_stores_response_once,
    cancel_depends_on_state,
    gc_trims_past_retention,
);
