//! Values produced by operator callbacks.
//!
//! A callback may answer right away, hand back a future, or hand back the
//! receiving end of a channel that some other task fills in later. The
//! engines resolve all three the same way.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;

pub enum Reply<T> {
    Ready(T),
    Future(BoxFuture<'static, T>),
    Channel(oneshot::Receiver<T>),
}

impl<T> Reply<T> {
    pub fn ready(value: T) -> Self {
        Reply::Ready(value)
    }

    pub fn future<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Reply::Future(Box::pin(future))
    }

    /// A pending reply and the sender that completes it.
    pub fn channel() -> (oneshot::Sender<T>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Reply::Channel(rx))
    }

    /// Waits for the value. `None` when a channel sender was dropped unanswered.
    pub async fn resolve(self) -> Option<T> {
        match self {
            Reply::Ready(value) => Some(value),
            Reply::Future(future) => Some(future.await),
            Reply::Channel(rx) => rx.await.ok(),
        }
    }
}

impl<T> From<T> for Reply<T> {
    fn from(value: T) -> Self {
        Reply::Ready(value)
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Ready(_) => f.write_str("Reply::Ready"),
            Reply::Future(_) => f.write_str("Reply::Future"),
            Reply::Channel(_) => f.write_str("Reply::Channel"),
        }
    }
}

/// Calls an operator callback and resolves its reply.
///
/// A panic, either in the call or while resolving, becomes `Err` with the
/// panic message.
pub(crate) async fn call_guarded<T, F>(callback: F) -> Result<Option<T>, String>
where
    F: FnOnce() -> Reply<T>,
{
    let reply = std::panic::catch_unwind(AssertUnwindSafe(callback))
        .map_err(|panic| panic_message(&*panic))?;
    AssertUnwindSafe(reply.resolve())
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(&*panic))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
