//! Batching coordinator scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strobe::batch::{BatchOptions, Batcher};
use strobe::{Context, Error};

fn doubling_batcher(
    calls: Arc<AtomicUsize>,
    seen: Arc<Mutex<Vec<Vec<u32>>>>,
    options: BatchOptions,
) -> Batcher<u32, u32> {
    Batcher::new(options, move |_ctx, args: Vec<u32>| {
        calls.fetch_add(1, Ordering::SeqCst);
        seen.lock().push(args.clone());
        async move { Ok(args.into_iter().map(|arg| arg * 2).collect()) }
    })
}

#[tokio::test(start_paused = true)]
async fn concurrent_invokes_share_one_flush() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let batcher = doubling_batcher(
        calls.clone(),
        seen.clone(),
        BatchOptions {
            max_size: 5,
            wait_interval: Duration::from_millis(20),
        },
    );

    let ctx = Context::background();
    let started = tokio::time::Instant::now();
    let (a, b, c) = tokio::join!(
        batcher.invoke(&ctx, 1),
        batcher.invoke(&ctx, 2),
        batcher.invoke(&ctx, 3),
    );

    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 4);
    assert_eq!(c.unwrap(), 6);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(*seen.lock(), vec![vec![1, 2, 3]]);
    assert!(started.elapsed() <= Duration::from_millis(25));
}

#[tokio::test(start_paused = true)]
async fn full_batch_flushes_without_waiting() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let batcher = doubling_batcher(
        calls.clone(),
        seen.clone(),
        BatchOptions {
            max_size: 2,
            wait_interval: Duration::from_secs(3600),
        },
    );

    let ctx = Context::background();
    let (a, b) = tokio::join!(batcher.invoke(&ctx, 10), batcher.invoke(&ctx, 11));
    assert_eq!(a.unwrap(), 20);
    assert_eq!(b.unwrap(), 22);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn runs_do_not_share_batches() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let batcher = doubling_batcher(
        calls.clone(),
        seen.clone(),
        BatchOptions {
            max_size: 10,
            wait_interval: Duration::from_millis(20),
        },
    );

    let first = Context::background();
    let second = Context::background();
    let (a, b) = tokio::join!(batcher.invoke(&first, 1), batcher.invoke(&second, 2));
    assert_eq!(a.unwrap(), 2);
    assert_eq!(b.unwrap(), 4);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn short_results_produce_short_batch_errors() {
    let batcher: Batcher<u32, u32> = Batcher::new(
        BatchOptions {
            max_size: 3,
            wait_interval: Duration::from_millis(20),
        },
        |_ctx, args: Vec<u32>| async move { Ok(args.into_iter().take(1).collect()) },
    );

    let ctx = Context::background();
    let (a, b) = tokio::join!(batcher.invoke(&ctx, 7), batcher.invoke(&ctx, 8));
    assert_eq!(a.unwrap(), 7);
    match b {
        Err(Error::ShortBatch { expected: 2, got: 1 }) => {}
        other => panic!("expected ShortBatch, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn bulk_error_reaches_every_slot() {
    let batcher: Batcher<u32, u32> = Batcher::new(
        BatchOptions {
            max_size: 10,
            wait_interval: Duration::from_millis(5),
        },
        |_ctx, _args| async { Err(Error::user(anyhow::anyhow!("upstream down"))) },
    );

    let ctx = Context::background();
    let (a, b) = tokio::join!(batcher.invoke(&ctx, 1), batcher.invoke(&ctx, 2));
    for result in [a, b].iter() {
        match result {
            Err(Error::User(err)) => assert_eq!(err.to_string(), "upstream down"),
            other => panic!("expected the upstream error, got {:?}", other),
        }
    }
}

#[tokio::test(start_paused = true)]
async fn cancelled_invoker_leaves_the_batch_intact() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let batcher = doubling_batcher(
        calls.clone(),
        seen.clone(),
        BatchOptions {
            max_size: 10,
            wait_interval: Duration::from_millis(20),
        },
    );

    let ctx = Context::background();
    let (cancelled_ctx, token) = ctx.with_cancellation();

    let surviving = batcher.invoke(&ctx, 1);
    let doomed = batcher.invoke(&cancelled_ctx, 2);
    let (doomed, surviving) = tokio::join!(
        async {
            // Cancel before the wait interval elapses.
            let cancel = async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                token.cancel();
            };
            let (result, _) = tokio::join!(doomed, cancel);
            result
        },
        surviving,
    );

    match doomed {
        Err(err) if err.is_cancellation() => {}
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(surviving.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The cancelled argument never went upstream.
    assert_eq!(*seen.lock(), vec![vec![1]]);
}
