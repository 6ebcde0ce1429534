use futures::prelude::*;
use kube::runtime::watcher::{Error, Event};
use std::pin::Pin;
use tokio::time;
use tracing::{info, Instrument};

/// Wraps an event stream that never terminates: on a stream error, log and
/// sleep briefly before polling again, rather than surfacing the error to
/// the reconciler. The next successful poll delivers a `Restarted` reset
/// event, so callers never need their own retry logic.
pub struct Watch<T> {
    initialized: bool,
    span: tracing::Span,
    rx: Pin<Box<dyn Stream<Item = Result<Event<T>, Error>> + Send + 'static>>,
}

impl<T, W> From<W> for Watch<T>
where
    W: Stream<Item = Result<Event<T>, Error>> + Send + 'static,
{
    fn from(watch: W) -> Self {
        Self::new(watch.boxed())
    }
}

impl<T> Watch<T> {
    pub fn new(rx: Pin<Box<dyn Stream<Item = Result<Event<T>, Error>> + Send + 'static>>) -> Self {
        Self {
            rx,
            initialized: false,
            span: tracing::Span::current(),
        }
    }

    pub fn instrument(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Receive the next event, retrying on stream errors.
    pub async fn recv(&mut self) -> Event<T> {
        loop {
            let ev = self
                .rx
                .next()
                .instrument(self.span.clone())
                .await
                .expect("watch stream must not terminate");

            match ev {
                Ok(ev) => {
                    self.initialized = true;
                    return ev;
                }
                Err(error) => {
                    info!(parent: &self.span, %error, "watch failed");
                    time::sleep(time::Duration::from_secs(1)).await;
                    info!(parent: &self.span, "restarting watch");
                }
            }
        }
    }
}
