//! Durable queue behaviour across restarts, and action delivery on top of it

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rdfm_client::Error;
use rdfm_client::actions::{ActionResult, ActionRunner, CommandAction, ResultSink};
use rdfm_client::error::StoreError;
use rdfm_client::store::FileStore;

#[test]
fn test_single_item_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::new(dir.path().join("q"), 100).unwrap();
        store.try_enqueue(&[0x00, 0x11, 0x22, 0x33]).unwrap();
    }

    let store = FileStore::new(dir.path().join("q"), 100).unwrap();
    assert_eq!(store.try_dequeue().unwrap(), vec![0x00, 0x11, 0x22, 0x33]);
    assert!(matches!(store.try_dequeue(), Err(Error::Store(StoreError::Empty))));
    assert_eq!(store.slots_available() + store.items_available(), store.capacity());
}

#[test]
fn test_back_pressure() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path().join("q"), 2).unwrap();
    store.try_enqueue(b"a").unwrap();
    store.try_enqueue(b"b").unwrap();
    assert!(matches!(store.try_enqueue(b"c"), Err(Error::Store(StoreError::Full))));

    assert_eq!(store.try_dequeue().unwrap(), b"a");
    store.try_enqueue(b"c").unwrap();
    assert_eq!(store.indexes().len(), 2);
}

#[test]
fn test_items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::new(dir.path().join("q"), 4).unwrap();
        store.try_enqueue(b"one").unwrap();
        store.try_enqueue(b"two").unwrap();
        store.try_enqueue(b"three").unwrap();
        assert_eq!(store.try_dequeue().unwrap(), b"one");
    }

    let store = FileStore::new(dir.path().join("q"), 4).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.slots_available(), 2);
    assert_eq!(store.try_dequeue().unwrap(), b"two");
    store.try_enqueue(b"four").unwrap();
    assert_eq!(store.try_dequeue().unwrap(), b"three");
    assert_eq!(store.try_dequeue().unwrap(), b"four");
    assert!(matches!(store.try_dequeue(), Err(Error::Store(StoreError::Empty))));
}

#[test]
fn test_reopen_with_smaller_capacity_keeps_items() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = FileStore::new(dir.path().join("q"), 5).unwrap();
        for i in 0..5u8 {
            store.try_enqueue(&[i + 1]).unwrap();
        }
    }

    let store = FileStore::new(dir.path().join("q"), 2).unwrap();
    assert_eq!(store.capacity(), 5);
    assert!(matches!(store.try_enqueue(b"x"), Err(Error::Store(StoreError::Full))));
    for i in 0..5u8 {
        assert_eq!(store.try_dequeue().unwrap(), vec![i + 1]);
    }
}

#[tokio::test]
async fn test_full_store_blocks_until_dequeue() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("q"), 1).unwrap());
    let cancel = CancellationToken::new();

    store.enqueue(b"first", &cancel).await.unwrap();
    assert!(matches!(store.try_enqueue(b"second"), Err(Error::Store(StoreError::Full))));

    let blocked = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { store.enqueue(b"second", &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    assert_eq!(store.dequeue(&cancel).await.unwrap(), b"first");
    blocked.await.unwrap().unwrap();
    assert_eq!(store.dequeue(&cancel).await.unwrap(), b"second");
}

#[tokio::test]
async fn test_dequeue_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("q"), 2).unwrap());
    let cancel = CancellationToken::new();

    let waiting = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { store.dequeue(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let err = waiting.await.unwrap().unwrap_err();
    assert!(err.is_cancelled(), "{err}");
    assert_eq!(store.slots_available(), 2);
}

#[tokio::test]
async fn test_reset_wakes_waiters() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStore::new(dir.path().join("q"), 2).unwrap());
    let cancel = CancellationToken::new();

    let waiting = {
        let store = Arc::clone(&store);
        let cancel = cancel.clone();
        tokio::spawn(async move { store.dequeue(&cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    store.reset().unwrap();

    assert!(matches!(
        waiting.await.unwrap(),
        Err(Error::Store(StoreError::Reset))
    ));
    assert!(store.is_empty());
    store.try_enqueue(b"fresh").unwrap();
    assert_eq!(store.try_dequeue().unwrap(), b"fresh");
}

/// Accepts a result only after refusing it `refusals` times
struct Flaky {
    refusals: AtomicUsize,
    offered: tokio::sync::Mutex<Vec<ActionResult>>,
    delivered: tokio::sync::Mutex<Vec<ActionResult>>,
}

#[async_trait]
impl ResultSink for Flaky {
    async fn deliver(&self, result: &ActionResult, _cancel: &CancellationToken) -> bool {
        self.offered.lock().await.push(result.clone());
        let left = self.refusals.load(Ordering::SeqCst);
        if left > 0 {
            self.refusals.store(left - 1, Ordering::SeqCst);
            return false;
        }
        self.delivered.lock().await.push(result.clone());
        true
    }
}

fn echo_action() -> Vec<CommandAction> {
    vec![CommandAction {
        id: "hello".into(),
        name: "Hello".into(),
        description: "Print a greeting".into(),
        argv: vec!["echo".into(), "hello".into()],
        timeout_seconds: 5.0,
    }]
}

#[tokio::test]
async fn test_queued_action_runs_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let runner = ActionRunner::new(dir.path(), 4, echo_action()).unwrap();
        assert!(runner.execute("exec-1", "hello"));
        assert_eq!(runner.requests().len(), 1);
    }

    let runner = Arc::new(
        ActionRunner::new(dir.path(), 4, echo_action())
            .unwrap()
            .with_retry_delay(Duration::from_millis(5)),
    );
    let sink = Arc::new(Flaky {
        refusals: AtomicUsize::new(2),
        offered: tokio::sync::Mutex::new(Vec::new()),
        delivered: tokio::sync::Mutex::new(Vec::new()),
    });
    let cancel = CancellationToken::new();

    let task = {
        let runner = Arc::clone(&runner);
        let sink = Arc::clone(&sink);
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(sink.as_ref(), &cancel).await })
    };

    tokio::time::timeout(Duration::from_secs(10), async {
        while sink.delivered.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    task.await.unwrap();

    let offered = sink.offered.lock().await;
    assert_eq!(offered.len(), 3);
    assert!(offered.iter().all(|r| *r == offered[0]));

    let delivered = sink.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].exec_id, "exec-1");
    assert_eq!(delivered[0].status_code, 0);
    assert!(runner.results().is_empty());
    assert!(runner.requests().is_empty());
}
