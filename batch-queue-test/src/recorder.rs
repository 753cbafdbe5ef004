//! A batch processor that records the batches it receives.

use std::{
    fmt,
    sync::{Arc, Mutex},
};

use futures::future::{self, Ready};
use tower::{service_fn, util::ServiceFn, BoxError};

/// Records every batch sent to the processors it creates.
///
/// Clones share the same record, so a test can keep one clone,
/// and move a processor into a batch queue.
pub struct BatchRecorder<Request> {
    batches: Arc<Mutex<Vec<Vec<Request>>>>,
}

impl<Request: Clone> BatchRecorder<Request> {
    /// Returns a new recorder with no batches.
    pub fn new() -> Self {
        BatchRecorder {
            batches: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Returns a copy of every batch recorded so far, in call order.
    pub fn batches(&self) -> Vec<Vec<Request>> {
        self.batches
            .lock()
            .expect("previous test panicked while holding the recorder mutex")
            .clone()
    }

    /// Returns the size of every batch recorded so far, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    /// Records a batch.
    pub fn record(&self, batch: &[Request]) {
        self.batches
            .lock()
            .expect("previous test panicked while holding the recorder mutex")
            .push(batch.to_vec());
    }

    /// Returns a batch processor that records each batch,
    /// then responds to each item with `f(item)`.
    #[allow(clippy::type_complexity)]
    pub fn processor<Response, F>(
        &self,
        f: F,
    ) -> ServiceFn<impl FnMut(Vec<Request>) -> Ready<Result<Vec<Response>, BoxError>>>
    where
        F: Fn(Request) -> Response,
    {
        let recorder = self.clone();

        service_fn(move |batch: Vec<Request>| {
            recorder.record(&batch);
            future::ready(Ok::<Vec<Response>, BoxError>(
                batch.into_iter().map(&f).collect(),
            ))
        })
    }
}

impl<Request: Clone> Default for BatchRecorder<Request> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Request> Clone for BatchRecorder<Request> {
    fn clone(&self) -> Self {
        BatchRecorder {
            batches: self.batches.clone(),
        }
    }
}

impl<Request: fmt::Debug> fmt::Debug for BatchRecorder<Request> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRecorder")
            .field("batches", &self.batches)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tower::{Service, ServiceExt};

    use super::*;

    #[tokio::test]
    async fn records_batches_in_call_order() -> Result<(), BoxError> {
        let recorder = BatchRecorder::new();
        let mut processor = recorder.processor(|item: u32| item + 100);

        let first = processor.ready().await?.call(vec![1, 2]).await?;
        let second = processor.ready().await?.call(vec![3]).await?;

        assert_eq!(first, vec![101, 102]);
        assert_eq!(second, vec![103]);
        assert_eq!(recorder.batches(), vec![vec![1, 2], vec![3]]);
        assert_eq!(recorder.batch_sizes(), vec![2, 1]);

        Ok(())
    }
}
