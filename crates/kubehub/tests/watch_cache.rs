#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use kestrel_core::{ApiResourceInfo, Gvr};
use kestrel_kubehub::{Delta, ResourceCatalog, ResourceMapper, WatchCacheRegistry, WatchSource, WatchStream};
use kestrel_schema::Scheme;
use kube::core::{DynamicObject, ErrorResponse};
use kube::runtime::watcher::{Error, Event};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Feed = UnboundedSender<Result<Event<DynamicObject>, Error>>;

#[derive(Default)]
struct FakeSource {
    opens: AtomicUsize,
    feeds: Mutex<Vec<Feed>>,
}

impl WatchSource for FakeSource {
    fn open(&self, _gvr: &Gvr) -> WatchStream {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = unbounded();
        self.feeds.lock().push(tx);
        rx.boxed()
    }
}

impl FakeSource {
    async fn feed(&self, idx: usize) -> Feed {
        for _ in 0..1000 {
            if let Some(tx) = self.feeds.lock().get(idx) {
                return tx.clone();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("stream {idx} was never opened");
    }
}

fn configmaps() -> Gvr { Gvr::new("", "v1", "configmaps") }

fn registry(source: Arc<FakeSource>, ctx: CancellationToken, relist: Duration) -> WatchCacheRegistry {
    let catalog = ResourceCatalog::from_resources(vec![ApiResourceInfo {
        group: String::new(),
        version: "v1".into(),
        kind: "ConfigMap".into(),
        plural: "configmaps".into(),
        namespaced: true,
        verbs: ["get", "list", "watch"].iter().map(|s| s.to_string()).collect(),
    }]);
    let mapper = ResourceMapper::new(Arc::new(catalog), Arc::new(Scheme::with_builtins()));
    WatchCacheRegistry::new(source, Arc::new(mapper), ctx, relist)
}

fn cm(uid: &str, name: &str, rv: &str) -> DynamicObject {
    serde_json::from_value(serde_json::json!({
        "metadata": { "name": name, "namespace": "default", "uid": uid, "resourceVersion": rv },
        "data": { "k": name }
    }))
    .unwrap()
}

fn names(deltas: &[Delta]) -> Vec<String> { deltas.iter().map(|d| d.object().name().to_string()).collect() }

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_get_creates_one_entry() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = Arc::new(registry(source.clone(), ctx.clone(), Duration::from_secs(3600)));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let reg = reg.clone();
        handles.push(tokio::spawn(async move { reg.get(&configmaps()) }));
    }
    let mut entries = Vec::new();
    for h in handles {
        entries.push(h.await.unwrap());
    }
    assert!(entries.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(reg.len(), 1);

    source.feed(0).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn subscriber_gets_replay_then_live_changes() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = registry(source.clone(), ctx.clone(), Duration::from_secs(3600));

    let entry = reg.get(&configmaps());
    let feed = source.feed(0).await;
    feed.unbounded_send(Ok(Event::Restarted(vec![cm("1", "a", "1"), cm("2", "b", "1")]))).unwrap();
    entry.wait_synced().await;

    let mut sub = reg.subscribe(ctx.child_token(), &configmaps());
    let replay = vec![sub.recv().await.unwrap(), sub.recv().await.unwrap()];
    assert!(replay.iter().all(|d| matches!(d, Delta::Added(_))));
    assert_eq!(names(&replay), vec!["a", "b"]);

    feed.unbounded_send(Ok(Event::Applied(cm("1", "a", "2")))).unwrap();
    feed.unbounded_send(Ok(Event::Applied(cm("3", "c", "1")))).unwrap();
    feed.unbounded_send(Ok(Event::Deleted(cm("2", "b", "1")))).unwrap();
    let live = vec![sub.recv().await.unwrap(), sub.recv().await.unwrap(), sub.recv().await.unwrap()];
    assert!(matches!(&live[0], Delta::Updated { old, new } if old.resource_version() == Some("1") && new.resource_version() == Some("2")));
    assert!(matches!(&live[1], Delta::Added(o) if o.name() == "c"));
    assert!(matches!(&live[2], Delta::Deleted(o) if o.name() == "b"));
    assert!(live[1].object().is_typed());
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn method_not_allowed_does_not_stop_the_entry() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = registry(source.clone(), ctx.clone(), Duration::from_secs(3600));

    let entry = reg.get(&configmaps());
    let feed = source.feed(0).await;
    let resp = ErrorResponse {
        status: "Failure".into(),
        message: "method not allowed".into(),
        reason: "MethodNotAllowed".into(),
        code: 405,
    };
    feed.unbounded_send(Err(Error::WatchError(resp))).unwrap();
    feed.unbounded_send(Ok(Event::Restarted(vec![cm("1", "a", "1")]))).unwrap();
    tokio::time::timeout(Duration::from_secs(5), entry.wait_synced()).await.unwrap();
    assert_eq!(entry.len(), 1);
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_the_subscriber_context_ends_only_the_subscription() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = registry(source.clone(), ctx.clone(), Duration::from_secs(3600));

    let sub_ctx = ctx.child_token();
    let mut sub = reg.subscribe(sub_ctx.clone(), &configmaps());
    let feed = source.feed(0).await;
    feed.unbounded_send(Ok(Event::Restarted(vec![cm("1", "a", "1")]))).unwrap();
    assert!(matches!(sub.recv().await, Some(Delta::Added(_))));

    sub_ctx.cancel();
    let end = tokio::time::timeout(Duration::from_secs(5), sub.recv()).await.unwrap();
    assert!(end.is_none());
    assert_eq!(sub.entry().subscriber_count(), 0);

    // entry keeps syncing
    feed.unbounded_send(Ok(Event::Applied(cm("2", "b", "1")))).unwrap();
    for _ in 0..100 {
        if sub.entry().len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(sub.entry().len(), 2);
    ctx.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_cancel_ends_all_subscriptions() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = registry(source.clone(), ctx.clone(), Duration::from_secs(3600));

    let mut a = reg.subscribe(CancellationToken::new(), &configmaps());
    let mut b = reg.subscribe(CancellationToken::new(), &configmaps());
    source.feed(0).await;
    reg.shutdown();
    let ends = tokio::time::timeout(Duration::from_secs(5), async { (a.recv().await, b.recv().await) })
        .await
        .unwrap();
    assert!(ends.0.is_none() && ends.1.is_none());
}

#[tokio::test(start_paused = true)]
async fn relist_interval_reopens_the_stream() {
    let source = Arc::new(FakeSource::default());
    let ctx = CancellationToken::new();
    let reg = registry(source.clone(), ctx.clone(), Duration::from_secs(60));

    let entry = reg.get(&configmaps());
    let first = source.feed(0).await;
    first.unbounded_send(Ok(Event::Restarted(vec![cm("1", "a", "1"), cm("2", "b", "1")]))).unwrap();
    entry.wait_synced().await;
    let mut sub = reg.subscribe(ctx.child_token(), &configmaps());
    sub.recv().await.unwrap();
    sub.recv().await.unwrap();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(source.opens.load(Ordering::SeqCst), 2);

    // the fresh listing no longer has "b"
    let second = source.feed(1).await;
    second.unbounded_send(Ok(Event::Restarted(vec![cm("1", "a", "1")]))).unwrap();
    match sub.recv().await.unwrap() {
        Delta::Deleted(o) => assert_eq!(o.name(), "b"),
        other => panic!("expected delete, got {other:?}"),
    }
    ctx.cancel();
}
