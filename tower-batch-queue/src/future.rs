//! Future types for the [`BatchExecutionQueue`](crate::BatchExecutionQueue).

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures_core::ready;
use pin_project::pin_project;

use super::{error::BatchError, message};

/// Future that completes when the batch containing this request has been processed.
///
/// Dropping this future does not withdraw the request from its batch,
/// it only discards the response.
#[pin_project]
#[derive(Debug)]
pub struct ResponseFuture<Response> {
    #[pin]
    state: ResponseState<Response>,
}

#[pin_project(project = ResponseStateProj)]
#[derive(Debug)]
enum ResponseState<Response> {
    Failed(Option<BatchError>),
    Rx(#[pin] message::Rx<Response>),
}

impl<Response> ResponseFuture<Response> {
    pub(crate) fn new(rx: message::Rx<Response>) -> Self {
        ResponseFuture {
            state: ResponseState::Rx(rx),
        }
    }

    pub(crate) fn failed(err: BatchError) -> Self {
        ResponseFuture {
            state: ResponseState::Failed(Some(err)),
        }
    }
}

impl<Response> Future for ResponseFuture<Response> {
    type Output = Result<Response, BatchError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.state.project() {
            ResponseStateProj::Failed(e) => {
                Poll::Ready(Err(e.take().expect("polled after error")))
            }
            ResponseStateProj::Rx(rx) => match ready!(rx.poll(cx)) {
                Ok(result) => Poll::Ready(result),
                // The worker dropped the sender without resolving it,
                // which only happens if the worker task died.
                Err(_) => Poll::Ready(Err(BatchError::WorkerLost)),
            },
        }
    }
}
