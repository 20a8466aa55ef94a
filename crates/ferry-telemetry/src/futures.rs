use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use fastrace::Span;
use pin_project_lite::pin_project;

/// Runs futures inside a span and lets the caller add properties based on the output.
pub trait RecordedFutureExt: Future + Sized {
    fn in_span_with_recorder<R>(self, span: Span, recorder: R) -> Recorded<Self, R>
    where
        R: FnOnce(&Span, &Self::Output),
    {
        Recorded {
            inner: self,
            pending: Some((span, recorder)),
        }
    }
}

impl<F: Future> RecordedFutureExt for F {}

pin_project! {
    /// A future whose span is set as the local parent on every poll.
    /// The span is submitted right after the recorder has seen the output.
    pub struct Recorded<F, R> {
        #[pin]
        inner: F,
        pending: Option<(Span, R)>,
    }
}

impl<F, R> Future for Recorded<F, R>
where
    F: Future,
    R: FnOnce(&Span, &F::Output),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let output = {
            let _guard = this.pending.as_ref().map(|(span, _)| span.set_local_parent());
            ready!(this.inner.poll(cx))
        };
        if let Some((span, recorder)) = this.pending.take() {
            recorder(&span, &output);
        }
        Poll::Ready(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recorder_sees_output() {
        let (tx, rx) = std::sync::mpsc::channel();
        let output = async { 42 }
            .in_span_with_recorder(Span::noop(), move |_, output| {
                let _ = tx.send(*output);
            })
            .await;
        assert_eq!(output, 42);
        assert_eq!(rx.try_recv().ok(), Some(42));
    }

    #[tokio::test]
    async fn test_recorder_runs_once_after_pending_polls() {
        let (tx, rx) = std::sync::mpsc::channel();
        let output = async {
            tokio::task::yield_now().await;
            "done"
        }
        .in_span_with_recorder(Span::noop(), move |_, output| {
            let _ = tx.send(output.to_string());
        })
        .await;
        assert_eq!(output, "done");
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec!["done".to_string()]);
    }
}
