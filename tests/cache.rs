//! Memoization cache behavior, exercised through a running computation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strobe::{add_dependency, cache, purge_cache, Context, Error, Rerunner, Resource};

/// Runs `compute` once under a rerunner and returns its value.
async fn run_once<T, F, Fut>(compute: F) -> Result<T, Error>
where
    T: Send + std::fmt::Debug + 'static,
    F: FnMut(Context) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<T, Error>> + Send + 'static,
{
    let ctx = Context::background();
    let (runner, mut updates) = Rerunner::new(&ctx, compute, Duration::ZERO, false);
    let result = updates.recv().await.expect("runner produced nothing");
    runner.stop();
    result
}

#[tokio::test]
async fn single_flight_shares_one_execution() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();

    let values = run_once(move |ctx| {
        let counter = counter.clone();
        async move {
            let mut workers = Vec::new();
            for _ in 0..8 {
                let ctx = ctx.clone();
                let counter = counter.clone();
                workers.push(tokio::spawn(async move {
                    cache(&ctx, "users:all", move |_ctx| async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, Error>(vec![1u32, 2, 3])
                    })
                    .await
                }));
            }
            let mut values = Vec::new();
            for worker in workers {
                values.push(worker.await.expect("worker panicked")?);
            }
            Ok(values)
        }
    })
    .await
    .unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(values.len(), 8);
    for value in values {
        assert_eq!(value, vec![1, 2, 3]);
    }
}

#[tokio::test]
async fn distinct_keys_compute_in_parallel() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (in_flight_outer, peak_outer) = (in_flight.clone(), peak.clone());
    run_once(move |ctx| {
        let in_flight = in_flight_outer.clone();
        let peak = peak_outer.clone();
        async move {
            let mut workers = Vec::new();
            for key in 0..4u32 {
                let ctx = ctx.clone();
                let in_flight = in_flight.clone();
                let peak = peak.clone();
                workers.push(tokio::spawn(async move {
                    cache(&ctx, key, move |_ctx| async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, Error>(key * 10)
                    })
                    .await
                }));
            }
            for worker in workers {
                worker.await.expect("worker panicked")?;
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    assert!(peak.load(Ordering::SeqCst) > 1, "no parallelism observed");
}

#[tokio::test]
async fn valid_entries_survive_the_rerun() {
    let d = Resource::new();
    let e = Resource::new();
    let a_runs = Arc::new(AtomicUsize::new(0));
    let b_runs = Arc::new(AtomicUsize::new(0));

    let ctx = Context::background();
    let (runner, mut updates) = {
        let (d, e) = (d.clone(), e.clone());
        let (a_runs, b_runs) = (a_runs.clone(), b_runs.clone());
        Rerunner::new(
            &ctx,
            move |ctx| {
                let (d, e) = (d.clone(), e.clone());
                let (a_runs, b_runs) = (a_runs.clone(), b_runs.clone());
                async move {
                    let a = cache(&ctx, "a", {
                        let a_runs = a_runs.clone();
                        move |ctx| async move {
                            a_runs.fetch_add(1, Ordering::SeqCst);
                            add_dependency(&ctx, &d);
                            Ok::<_, Error>(1u32)
                        }
                    })
                    .await?;
                    let b = cache(&ctx, "b", {
                        let b_runs = b_runs.clone();
                        move |ctx| async move {
                            b_runs.fetch_add(1, Ordering::SeqCst);
                            add_dependency(&ctx, &e);
                            Ok::<_, Error>(2u32)
                        }
                    })
                    .await?;
                    Ok(a + b)
                }
            },
            Duration::ZERO,
            false,
        )
    };

    assert_eq!(updates.recv().await.unwrap().unwrap(), 3);
    assert_eq!(a_runs.load(Ordering::SeqCst), 1);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);

    // Only the subgraph under `d` recomputes.
    d.invalidate();
    assert_eq!(updates.recv().await.unwrap().unwrap(), 3);
    assert_eq!(a_runs.load(Ordering::SeqCst), 2);
    assert_eq!(b_runs.load(Ordering::SeqCst), 1);
    assert!(!e.is_invalidated());

    runner.stop();
}

#[tokio::test]
async fn nested_dependency_triggers_exactly_one_rerun() {
    let d = Resource::new();
    let inner_runs = Arc::new(AtomicUsize::new(0));

    let ctx = Context::background();
    let (runner, mut updates) = {
        let d = d.clone();
        let inner_runs = inner_runs.clone();
        Rerunner::new(
            &ctx,
            move |ctx| {
                let d = d.clone();
                let inner_runs = inner_runs.clone();
                async move {
                    cache(&ctx, "a", move |ctx| async move {
                        inner_runs.fetch_add(1, Ordering::SeqCst);
                        add_dependency(&ctx, &d);
                        Ok::<_, Error>(1u32)
                    })
                    .await
                }
            },
            Duration::ZERO,
            false,
        )
    };

    assert_eq!(updates.recv().await.unwrap().unwrap(), 1);
    d.invalidate();
    assert_eq!(updates.recv().await.unwrap().unwrap(), 1);
    assert_eq!(inner_runs.load(Ordering::SeqCst), 2);

    // No further runs are pending.
    let extra = tokio::time::timeout(Duration::from_millis(50), updates.recv()).await;
    assert!(extra.is_err(), "unexpected extra publish: {:?}", extra);

    runner.stop();
}

#[tokio::test]
async fn purge_forces_recomputation_within_a_run() {
    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();

    run_once(move |ctx| {
        let counter = counter.clone();
        async move {
            let body = {
                let counter = counter.clone();
                move |_ctx: Context| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, Error>(7u32)
                    }
                }
            };
            cache(&ctx, "k", body.clone()).await?;
            cache(&ctx, "k", body.clone()).await?;
            purge_cache(&ctx).await?;
            cache(&ctx, "k", body).await?;
            Ok(())
        }
    })
    .await
    .unwrap();

    assert_eq!(executions.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn in_run_errors_are_shared_but_not_carried_over() {
    let d = Resource::new();
    let attempts = Arc::new(AtomicUsize::new(0));

    let ctx = Context::background();
    let (runner, mut updates) = {
        let d = d.clone();
        let attempts = attempts.clone();
        Rerunner::new(
            &ctx,
            move |ctx| {
                let d = d.clone();
                let attempts = attempts.clone();
                async move {
                    add_dependency(&ctx, &d);
                    let result = cache(&ctx, "flaky", {
                        let attempts = attempts.clone();
                        move |_ctx| async move {
                            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                                Err(Error::user(anyhow::anyhow!("transient")))
                            } else {
                                Ok(9u32)
                            }
                        }
                    })
                    .await;
                    // The first run recovers the sub-branch locally.
                    Ok(result.unwrap_or(0))
                }
            },
            Duration::ZERO,
            false,
        )
    };

    assert_eq!(updates.recv().await.unwrap().unwrap(), 0);

    // The erroneous entry was not cached across runs: the rerun computes
    // it again and succeeds.
    d.invalidate();
    assert_eq!(updates.recv().await.unwrap().unwrap(), 9);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    runner.stop();
}
