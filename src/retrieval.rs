//! Background message retrieval.
//!
//! An [`ArticleSource`] stages raw articles into the unread message directory.
//! [`RetrievalTask`] runs one on its own thread; the caller polls `is_done`
//! and reads the result slot. Retrieval never touches ratchet state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

/// Outcome of a finished retrieval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalResult {
    /// Whether the news server could be reached.
    pub server_found: bool,
}

/// A channel new articles are fetched from.
pub trait ArticleSource: Send + 'static {
    /// fetch stages new articles and reports whether the server answered.
    ///
    /// Implementations check `cancel` between articles and return early once
    /// it is set.
    fn fetch(&mut self, cancel: &AtomicBool) -> Result<bool, anyhow::Error>;
}

/// RetrievalTask is a cancellable background run of an [`ArticleSource`].
pub struct RetrievalTask {
    cancel: Arc<AtomicBool>,
    done: Arc<AtomicBool>,
    result: Arc<Mutex<Option<RetrievalResult>>>,
    handle: Option<JoinHandle<()>>,
}

impl RetrievalTask {
    /// start spawns the retrieval thread
    pub fn start(mut source: impl ArticleSource) -> Result<Self, anyhow::Error> {
        let cancel = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let result = Arc::new(Mutex::new(None));

        let (thread_cancel, thread_done, thread_result) = (cancel.clone(), done.clone(), result.clone());
        let handle = thread::Builder::new().name("retrieval".to_string()).spawn(move || {
            let server_found = match source.fetch(&thread_cancel) {
                Ok(found) => found,
                Err(e) => {
                    warn!(error = %e, "retrieval failed");
                    false
                }
            };
            if !thread_cancel.load(Ordering::SeqCst) {
                *thread_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(RetrievalResult { server_found });
            }
            thread_done.store(true, Ordering::SeqCst);
            debug!(server_found, "retrieval finished");
        })?;
        info!("retrieval started");
        Ok(Self { cancel, done, result, handle: Some(handle) })
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    /// The result, once the task finished without being stopped.
    pub fn result(&self) -> Option<RetrievalResult> {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// stop asks the source to give up and waits for the thread
    pub fn stop(&mut self) {
        self.cancel.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("retrieval thread panicked");
            }
        }
        info!("retrieval stopped");
    }
}

impl Drop for RetrievalTask {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    struct Immediate(Result<bool, String>);

    impl ArticleSource for Immediate {
        fn fetch(&mut self, _cancel: &AtomicBool) -> Result<bool, anyhow::Error> {
            self.0.clone().map_err(anyhow::Error::msg)
        }
    }

    struct UntilCancelled;

    impl ArticleSource for UntilCancelled {
        fn fetch(&mut self, cancel: &AtomicBool) -> Result<bool, anyhow::Error> {
            while !cancel.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(5));
            }
            Ok(true)
        }
    }

    fn wait(task: &RetrievalTask) {
        let start = Instant::now();
        while !task.is_done() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn reports_server_found() {
        let task = RetrievalTask::start(Immediate(Ok(true))).unwrap();
        wait(&task);
        assert_eq!(task.result(), Some(RetrievalResult { server_found: true }));
    }

    #[test]
    fn failure_means_no_server() {
        let task = RetrievalTask::start(Immediate(Err("connection refused".to_string()))).unwrap();
        wait(&task);
        assert_eq!(task.result(), Some(RetrievalResult { server_found: false }));
    }

    #[test]
    fn stop_discards_result() {
        let mut task = RetrievalTask::start(UntilCancelled).unwrap();
        assert!(!task.is_done());
        task.stop();
        assert!(task.is_done());
        assert_eq!(task.result(), None);
    }
}
