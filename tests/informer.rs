use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use kubernetes::testing::{Call, ScriptedSource, object, object_with_labels};
use kubernetes::{DynamicObject, HandlerFuncs, Informer, ObjectKey, Store, WatchEvent};
use kwatch::app::{Stopped, serve};
use kwatch::signal::SignalTo;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type Events = Arc<Mutex<Vec<String>>>;

fn describe(obj: &DynamicObject) -> String {
    format!(
        "{}@{}",
        obj.key(),
        obj.resource_version().unwrap_or_default()
    )
}

fn recorder(events: &Events) -> HandlerFuncs {
    let add = Arc::clone(events);
    let update = Arc::clone(events);
    let delete = Arc::clone(events);

    HandlerFuncs::new()
        .on_add(move |obj| {
            add.lock().push(format!("add {}", describe(obj)));
            Ok(())
        })
        .on_update(move |old, new| {
            update
                .lock()
                .push(format!("update {} -> {}", describe(old), describe(new)));
            Ok(())
        })
        .on_delete(move |obj| {
            delete.lock().push(format!("delete {}", describe(obj)));
            Ok(())
        })
}

struct Running {
    events: Events,
    store: Store,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Running {
    fn start(source: ScriptedSource, resync_period: Duration) -> Running {
        let events = Events::default();
        let mut informer = Informer::new(source).resync_period(resync_period);
        informer.add_handler(recorder(&events));

        let store = informer.store();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(informer.run(shutdown.clone()));

        Running {
            events,
            store,
            shutdown,
            task,
        }
    }

    /// Wait up to a minute of tokio time for `count` notifications.
    async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..6000 {
            if self.events.lock().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        self.events.lock().clone()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.task.await.unwrap();
    }
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(Some("default"), name)
}

#[tokio::test(start_paused = true)]
async fn add_then_update_with_new_labels() {
    let source = ScriptedSource::new();
    source.push_list(
        vec![object_with_labels("default", "web", "1", &[("app", "web")])],
        "1",
    );
    let tx = source.push_watch_channel();

    let running = Running::start(source.clone(), Duration::ZERO);
    assert_eq!(running.wait_for(1).await, vec!["add default/web@1"]);

    tx.send(Ok(WatchEvent::Modified(object_with_labels(
        "default",
        "web",
        "2",
        &[("app", "web2")],
    ))))
    .unwrap();

    assert_eq!(
        running.wait_for(2).await,
        vec!["add default/web@1", "update default/web@1 -> default/web@2"]
    );

    let cached = running.store.get(&key("web")).unwrap();
    assert_eq!(cached.labels().get("app").map(String::as_str), Some("web2"));
    assert_eq!(cached.resource_version(), Some("2"));

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn delete_of_unknown_object() {
    let source = ScriptedSource::new();
    source.push_list(vec![], "1");
    source.push_watch(vec![Ok(WatchEvent::Deleted(object("default", "ghost", "3")))]);

    let running = Running::start(source, Duration::ZERO);

    assert_eq!(running.wait_for(1).await, vec!["delete default/ghost@3"]);
    assert!(running.store.get(&key("ghost")).is_none());
    assert!(running.store.is_empty());

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn resync_delivers_cached_objects_again() {
    let source = ScriptedSource::new();
    source.push_list(vec![object("default", "web", "1")], "1");

    let running = Running::start(source, Duration::from_secs(30));

    assert_eq!(
        running.wait_for(2).await,
        vec!["add default/web@1", "update default/web@1 -> default/web@1"]
    );

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_does_not_repeat_events() {
    let source = ScriptedSource::new();
    source.push_list(vec![object("default", "web", "1")], "1");
    source.push_watch(vec![Ok(WatchEvent::Added(object("default", "api", "2")))]);
    // the server replays the last event it sent before the close
    source.push_watch(vec![
        Ok(WatchEvent::Added(object("default", "api", "2"))),
        Ok(WatchEvent::Modified(object("default", "api", "3"))),
    ]);

    let running = Running::start(source.clone(), Duration::ZERO);

    assert_eq!(
        running.wait_for(3).await,
        vec![
            "add default/web@1",
            "add default/api@2",
            "update default/api@2 -> default/api@3",
        ]
    );

    let calls = source.calls();
    assert_eq!(
        &calls[..3],
        &[
            Call::List,
            Call::Watch("1".into()),
            Call::Watch("2".into())
        ]
    );
    assert!(!calls.contains(&Call::Watch("0".into())));
    assert_eq!(calls.iter().filter(|call| **call == Call::List).count(), 1);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn events_are_delivered_in_order() {
    let source = ScriptedSource::new();
    source.push_list(
        vec![
            object("default", "a", "1"),
            object("default", "b", "2"),
            object("default", "c", "3"),
        ],
        "3",
    );
    let tx = source.push_watch_channel();

    let running = Running::start(source, Duration::ZERO);
    assert_eq!(
        running.wait_for(3).await,
        vec!["add default/a@1", "add default/b@2", "add default/c@3"]
    );

    tx.send(Ok(WatchEvent::Modified(object("default", "c", "4"))))
        .unwrap();
    tx.send(Ok(WatchEvent::Modified(object("default", "a", "5"))))
        .unwrap();
    tx.send(Ok(WatchEvent::Deleted(object("default", "b", "6"))))
        .unwrap();

    let events = running.wait_for(6).await;
    assert_eq!(
        events[3..],
        [
            "update default/c@3 -> default/c@4",
            "update default/a@1 -> default/a@5",
            "delete default/b@2",
        ]
    );

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn store_holds_net_effect_of_events() {
    let source = ScriptedSource::new();
    source.push_list(vec![], "1");
    source.push_watch(vec![
        Ok(WatchEvent::Added(object("default", "a", "2"))),
        Ok(WatchEvent::Added(object("default", "b", "3"))),
        Ok(WatchEvent::Modified(object("default", "a", "4"))),
        Ok(WatchEvent::Deleted(object("default", "b", "5"))),
        Ok(WatchEvent::Added(object("default", "c", "6"))),
    ]);
    // replayed after the reconnect
    source.push_watch(vec![
        Ok(WatchEvent::Modified(object("default", "a", "4"))),
        Ok(WatchEvent::Added(object("default", "c", "6"))),
    ]);

    let running = Running::start(source.clone(), Duration::ZERO);

    // List, Watch 1, the replay from 6, then the idle watch from 6
    for _ in 0..100 {
        if source.calls().len() >= 4 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        source.calls(),
        vec![
            Call::List,
            Call::Watch("1".into()),
            Call::Watch("6".into()),
            Call::Watch("6".into()),
        ]
    );

    let mut cached = running
        .store
        .list()
        .iter()
        .map(|obj| describe(obj))
        .collect::<Vec<_>>();
    cached.sort();
    assert_eq!(cached, vec!["default/a@4", "default/c@6"]);

    let events = running.events.lock().clone();
    let count = |event: &str| events.iter().filter(|e| *e == event).count();
    assert_eq!(count("add default/a@2"), 1);
    assert_eq!(count("update default/a@2 -> default/a@4"), 1);
    assert_eq!(count("add default/c@6"), 1);
    assert_eq!(count("update default/a@4 -> default/a@4"), 0);
    assert_eq!(count("update default/c@6 -> default/c@6"), 0);

    running.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_handler_does_not_stall_watching() {
    let source = ScriptedSource::new();
    source.push_list(vec![object("default", "web", "1")], "1");
    source.push_watch(vec![Ok(WatchEvent::Added(object("default", "api", "2")))]);

    let finished = Arc::new(AtomicBool::new(false));
    let mut informer = Informer::new(source.clone());
    informer.add_handler(HandlerFuncs::new().on_add({
        let finished = Arc::clone(&finished);
        move |obj| {
            if obj.name() == "web" {
                std::thread::sleep(Duration::from_secs(2));
                finished.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }));

    let shutdown = CancellationToken::new();
    let task = tokio::spawn(informer.run(shutdown.clone()));

    // the closed watch is resumed after the first back-off delay, well
    // before the handler of web returns
    let resumed = tokio::time::timeout(Duration::from_millis(1500), async {
        while !source.calls().contains(&Call::Watch("2".into())) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(resumed.is_ok(), "calls: {:?}", source.calls());
    assert!(!finished.load(Ordering::SeqCst));

    shutdown.cancel();
    task.await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
}

fn slow_informer(started: &Arc<AtomicBool>, finished: &Arc<AtomicBool>) -> Informer<ScriptedSource> {
    let source = ScriptedSource::new();
    source.push_list(vec![object("default", "web", "1")], "1");

    let started = Arc::clone(started);
    let finished = Arc::clone(finished);
    let mut informer = Informer::new(source);
    informer.add_handler(HandlerFuncs::new().on_add(move |_obj| {
        started.store(true, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(300));
        finished.store(true, Ordering::SeqCst);
        Ok(())
    }));

    informer
}

fn signal_once_started(
    started: &Arc<AtomicBool>,
    signal: SignalTo,
) -> impl futures::Stream<Item = SignalTo> + Unpin {
    let started = Arc::clone(started);

    Box::pin(
        futures::stream::once(async move {
            while !started.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            signal
        })
        .chain(futures::stream::pending()),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_running_handler() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let informer = slow_informer(&started, &finished);
    let store = informer.store();
    let signals = signal_once_started(&started, SignalTo::Shutdown);

    let stopped = serve(informer, signals, Duration::from_secs(5)).await;

    assert_eq!(stopped, Stopped::Graceful);
    assert!(finished.load(Ordering::SeqCst));
    assert!(store.get(&key("web")).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grace_period_is_bounded() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let informer = slow_informer(&started, &finished);
    let signals = signal_once_started(&started, SignalTo::Shutdown);

    let stopped = serve(informer, signals, Duration::from_millis(50)).await;

    assert_eq!(stopped, Stopped::TimedOut);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quit_stops_immediately() {
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let informer = slow_informer(&started, &finished);
    let signals = signal_once_started(&started, SignalTo::Quit);

    let stopped = serve(informer, signals, Duration::from_secs(5)).await;

    assert_eq!(stopped, Stopped::Forced);
}
