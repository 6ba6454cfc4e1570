//! Randomized stress: several runners over a shared set of rotating
//! resources, strobed from a driver task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use strobe::{add_dependency, cache, Context, Error, Rerunner, Resource};

const N_RUNNERS: usize = 4;
const N_SLOTS: usize = 8;
const N_STROBES: usize = 50;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runners_survive_random_strobing() {
    let _ = env_logger::builder().is_test(true).try_init();

    let slots: Arc<Vec<Mutex<Resource>>> =
        Arc::new((0..N_SLOTS).map(|_| Mutex::new(Resource::new())).collect());
    let published = Arc::new(AtomicUsize::new(0));

    let mut runners = Vec::new();
    let mut consumers = Vec::new();
    for i in 0..N_RUNNERS {
        let slots = slots.clone();
        let (runner, mut updates) = Rerunner::new(
            &Context::background(),
            move |ctx| {
                let slots = slots.clone();
                async move {
                    let mut total = 0u64;
                    for offset in 0..3 {
                        let index = (i + offset) % N_SLOTS;
                        let slots = slots.clone();
                        total += cache(&ctx, index, move |ctx| async move {
                            add_dependency(&ctx, &slots[index].lock());
                            Ok::<_, Error>(index as u64)
                        })
                        .await?;
                    }
                    Ok(total)
                }
            },
            Duration::from_millis(1),
            false,
        );
        runners.push(runner);

        let published = published.clone();
        consumers.push(tokio::spawn(async move {
            while let Some(result) = updates.recv().await {
                result.expect("runner terminated with an error");
                published.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    // Drive random invalidations.
    {
        let mut rng = rand::thread_rng();
        for _ in 0..N_STROBES {
            let slot = rng.gen_range(0..N_SLOTS);
            let previous = {
                let mut slot = slots[slot].lock();
                std::mem::replace(&mut *slot, Resource::new())
            };
            previous.strobe();
            tokio::time::sleep(Duration::from_millis(rng.gen_range(1..4))).await;
        }
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    for runner in &runners {
        runner.stop();
    }
    for consumer in consumers {
        consumer.await.unwrap();
    }

    assert!(
        published.load(Ordering::SeqCst) >= N_RUNNERS,
        "only {} publishes",
        published.load(Ordering::SeqCst)
    );
}
