//! Randomised property tests for batch partitioning and positional correspondence.

use std::time::Duration;

use futures::future::join_all;
use proptest::prelude::*;

use batch_queue_test::BatchRecorder;
use tower_batch_queue::{BatchExecutionQueue, Config};

/// Submits every item back-to-back, and returns each response and the recorded batches.
fn run_queue(config: Config, items: &[u32]) -> (Vec<Option<u64>>, Vec<Vec<u32>>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .expect("test runtime builds");

    runtime.block_on(async {
        let recorder = BatchRecorder::new();
        let queue: BatchExecutionQueue<_, u32, u64> = BatchExecutionQueue::with_config(
            recorder.processor(|item: u32| u64::from(item) * 3),
            config,
        );
        queue.start_worker().await.expect("a new queue starts");

        let responses = join_all(items.iter().map(|item| queue.execute(*item))).await;

        queue.stop_worker().await.expect("the worker stops cleanly");

        let responses = responses.into_iter().map(Result::ok).collect();
        (responses, recorder.batches())
    })
}

proptest! {
    #[test]
    fn every_caller_gets_its_own_response(
        batch_size in 1..8usize,
        max_concurrent_batches in 1..3usize,
        items in proptest::collection::vec(any::<u32>(), 0..40),
    ) {
        let _init_guard = batch_queue_test::init();

        let config = Config {
            batch_size,
            timeout: Duration::from_millis(100),
            max_concurrent_batches,
            ..Config::default()
        };
        let (responses, batches) = run_queue(config, &items);

        for (item, response) in items.iter().zip(responses) {
            prop_assert_eq!(response, Some(u64::from(*item) * 3));
        }

        // Batches preserve submission order, and never skip or repeat an item.
        prop_assert_eq!(batches.concat(), items.clone());

        prop_assert!(
            batches.iter().all(|batch| !batch.is_empty() && batch.len() <= batch_size),
            "batch sizes out of range: {:?}",
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
        );

        // Items submitted back-to-back fill every batch except the last.
        prop_assert_eq!(batches.len(), items.len().div_ceil(batch_size));
    }
}
