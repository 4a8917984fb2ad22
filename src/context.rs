//! Per-request cancellation.
//!
//! A [`Context`] travels with a request in its `http::Extensions`. Every
//! suspension point of an exchange (dial, handshake, stream open, frame
//! reads) races against [`Context::done`].

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::Error;

type SignalWait = Pin<Box<dyn Future<Output = bool> + Send>>;

/// Cancellation signal plus an optional deadline.
///
/// Derived contexts inherit every signal of their parent, so canceling a
/// parent cancels all its children.
#[derive(Debug, Clone, Default)]
pub struct Context {
    signals: Vec<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Cancels the [`Context`] it was created with.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that is never canceled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that is additionally canceled by the returned handle.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let mut ctx = self.clone();
        ctx.signals.push(rx);
        (ctx, CancelHandle { tx })
    }

    /// Derive a context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context that expires at `deadline` (or the parent's, if
    /// earlier).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        ctx
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The cancellation error, if the context is already done.
    pub fn err(&self) -> Option<Error> {
        if self.signals.iter().any(|rx| *rx.borrow()) {
            return Some(Error::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Error::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    ///
    /// Never resolves for a context without signals and deadline, or whose
    /// cancel handles were all dropped without canceling.
    pub async fn done(&self) -> Error {
        if let Some(err) = self.err() {
            return err;
        }

        let mut waits: Vec<SignalWait> = self
            .signals
            .iter()
            .map(|rx| {
                let mut rx = rx.clone();
                Box::pin(async move { rx.wait_for(|canceled| *canceled).await.is_ok() }) as SignalWait
            })
            .collect();

        let canceled = poll_fn(|cx| {
            let mut i = 0;
            while i < waits.len() {
                match waits[i].as_mut().poll(cx) {
                    Poll::Ready(true) => return Poll::Ready(()),
                    // handle dropped: this signal can never fire
                    Poll::Ready(false) => {
                        waits.swap_remove(i);
                    }
                    Poll::Pending => i += 1,
                }
            }
            Poll::Pending
        });

        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = canceled => Error::Canceled,
                _ = tokio::time::sleep_until(deadline) => Error::DeadlineExceeded,
            },
            None => {
                canceled.await;
                Error::Canceled
            }
        }
    }

    /// Run `fut` unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            out = fut => Ok(out),
        }
    }
}
