use mapflow::storage::{BackoffPolicy, Callback, ResourceCache, StubFileSource};
use mapflow::{RequestManager, Resource, Response};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn manager(stub: Arc<StubFileSource>) -> RequestManager {
    RequestManager::new(
        stub,
        Arc::new(ResourceCache::memory_only(1 << 20)),
        BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            max_retries: 0,
            jitter_ratio: 0.0,
        },
        Handle::current(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_fetch() {
    init_logging();
    const CALLERS: usize = 8;
    let stub = Arc::new(
        StubFileSource::new(Handle::current()).with_delay(Duration::from_millis(100)),
    );
    stub.add_data("https://t/5/10/12.pbf", vec![7u8; 64]);
    let manager = manager(stub.clone());
    let (tx, mut rx) = mpsc::unbounded_channel::<Response>();
    let barrier = Arc::new(Barrier::new(CALLERS));

    let threads: Vec<_> = (0..CALLERS)
        .map(|_| {
            let manager = manager.clone();
            let tx = tx.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                let callback: Callback = Box::new(move |response| {
                    let _ = tx.send(response);
                });
                manager.get(Resource::image("https://t/5/10/12.pbf"), callback)
            })
        })
        .collect();
    let requests: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

    for _ in 0..CALLERS {
        let response = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.data.unwrap().len(), 64);
    }
    assert_eq!(stub.request_count("https://t/5/10/12.pbf"), 1);
    assert_eq!(manager.upstream_request_count(), 1);
    drop(requests);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_callback_after_cancel_returns() {
    init_logging();
    let stub = Arc::new(StubFileSource::new(Handle::current()));
    let manager = manager(stub.clone());
    let late_calls = Arc::new(AtomicUsize::new(0));

    for i in 0..300 {
        let url = format!("https://t/race/{}", i);
        stub.add_data(url.clone(), vec![1u8]);
        let cancelled = Arc::new(AtomicBool::new(false));
        let callback: Callback = {
            let cancelled = cancelled.clone();
            let late_calls = late_calls.clone();
            Box::new(move |_| {
                if cancelled.load(Ordering::SeqCst) {
                    late_calls.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        let request = manager.get(Resource::image(url), callback);

        // Cancel from another thread at a random point in the delivery
        let canceller = {
            let cancelled = cancelled.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_micros(fastrand::u64(0..200)));
                request.cancel();
                cancelled.store(true, Ordering::SeqCst);
            })
        };
        tokio::task::spawn_blocking(move || canceller.join().unwrap())
            .await
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(late_calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.in_flight_count(), 0);
}
