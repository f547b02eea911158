//! Background task primitives: shutdown broadcasting, abort-on-drop child
//! tasks and the `Task` trait implemented by the long-running loops
//! (listeners, registrar, drift watch, LRU sweep).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    pub async fn all_closed(&self) {
        self.0.closed().await;
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped, so a connection task cannot outlive
/// the listener that accepted it.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + Send + 'static,
{
    ChildTask(tokio::task::spawn(task.run(shutdown_signal)))
}

/// Binary exponential backoff between retries of a background operation,
/// clamped to `max`. `reset` returns to the initial interval after a
/// success.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_clamps() {
        let mut b = Backoff::new(Duration::from_secs(2), Duration::from_secs(600));
        let mut last = Duration::ZERO;
        for _ in 0..12 {
            last = b.next_delay();
        }
        assert_eq!(last, Duration::from_secs(600));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn shutdown_signal_fans_out() {
        let (handle, signal) = ShutdownHandle::new();
        let mut a = signal.clone();
        let mut b = signal;
        let task = tokio::spawn(async move {
            a.wait().await;
            b.wait().await;
        });
        handle.signal();
        task.await.expect("both receivers observe the signal");
    }
}
