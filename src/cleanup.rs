//! Teardown helpers.
//!
//! Teardown never fails: secondary errors while closing sockets or
//! releasing resources are logged at debug level and dropped.

use std::fmt::Display;
use tokio::task::JoinHandle;

/// Log and swallow the error of a teardown step.
pub fn best_effort<T, E: Display>(what: &str, result: Result<T, E>) {
    if let Err(e) = result {
        tracing::debug!(step = what, error = %e, "cleanup step failed");
    }
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> AbortOnDrop<T> {
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self(handle)
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn abort_on_drop_stops_task() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
        let guard = AbortOnDrop::new(tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }));
        drop(guard);
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed, Ok(None));
    }

    #[test]
    fn best_effort_swallows_errors() {
        best_effort("noop", Err::<(), _>("boom"));
        best_effort("noop", Ok::<_, String>(()));
    }
}
