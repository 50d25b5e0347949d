//! Completion channel for asynchronous operations.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

use tracing::error;

use crate::error::OpError;
use crate::operation::OprId;
use crate::sync::{lock, wait};

/// Receiver of operation completions; implemented by the engine.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, opr: OprId, result: Result<(), OpError>);
}

/// One-shot capability handed to an asynchronous operation body.
///
/// Every method consumes the token, so it cannot fire twice. A token that is
/// dropped without firing completes its operation as failed.
pub struct Completion {
    sink: Option<Arc<dyn CompletionSink>>,
    opr: OprId,
}

impl Completion {
    pub(crate) fn new(sink: Arc<dyn CompletionSink>, opr: OprId) -> Self {
        Self { sink: Some(sink), opr }
    }

    /// Identity of the operation this token completes.
    pub fn opr_id(&self) -> OprId {
        self.opr
    }

    /// Signal successful completion.
    pub fn complete(self) {
        self.finish(Ok(()));
    }

    /// Signal that the operation failed.
    pub fn fail(self, err: impl Into<anyhow::Error>) {
        self.finish(Err(OpError::new(err.into())));
    }

    /// Signal completion with an explicit result.
    pub fn finish(mut self, result: Result<(), OpError>) {
        if let Some(sink) = self.sink.take() {
            sink.complete(self.opr, result);
        }
    }
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.take() {
            error!(opr = self.opr, "completion token dropped without firing");
            sink.complete(self.opr, Err(OpError::msg("completion token dropped without firing")));
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("opr", &self.opr)
            .field("armed", &self.sink.is_some())
            .finish()
    }
}

/// One-shot result slot a waiting pusher blocks on.
#[derive(Default)]
pub(crate) struct Signal {
    slot: Mutex<Option<Result<(), OpError>>>,
    ready: Condvar,
}

impl Signal {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set(&self, result: Result<(), OpError>) {
        let mut slot = lock(&self.slot);
        *slot = Some(result);
        self.ready.notify_all();
    }

    pub(crate) fn wait(&self) -> Result<(), OpError> {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = wait(&self.ready, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(OprId, bool)>>,
    }

    impl CompletionSink for Recorder {
        fn complete(&self, opr: OprId, result: Result<(), OpError>) {
            lock(&self.calls).push((opr, result.is_ok()));
        }
    }

    fn token(opr: OprId) -> (Arc<Recorder>, Completion) {
        let rec = Arc::new(Recorder::default());
        let sink: Arc<dyn CompletionSink> = rec.clone();
        (rec, Completion::new(sink, opr))
    }

    #[test]
    fn complete_reports_success_once() {
        let (rec, done) = token(3);
        assert_eq!(done.opr_id(), 3);
        done.complete();
        assert_eq!(*lock(&rec.calls), vec![(3, true)]);
    }

    #[test]
    fn fail_reports_error() {
        let (rec, done) = token(4);
        done.fail(anyhow::anyhow!("device lost"));
        assert_eq!(*lock(&rec.calls), vec![(4, false)]);
    }

    #[test]
    fn dropped_token_completes_as_failure() {
        let (rec, done) = token(5);
        drop(done);
        assert_eq!(*lock(&rec.calls), vec![(5, false)]);
    }

    #[test]
    fn token_can_fire_from_another_thread() {
        let (rec, done) = token(6);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            done.complete();
        })
        .join()
        .unwrap();
        assert_eq!(*lock(&rec.calls), vec![(6, true)]);
    }

    #[test]
    fn signal_delivers_result_to_waiter() {
        let signal = Arc::new(Signal::new());
        let s = Arc::clone(&signal);
        let waiter = thread::spawn(move || s.wait());
        thread::sleep(Duration::from_millis(5));
        signal.set(Err(OpError::msg("late failure")));
        let result = waiter.join().unwrap();
        assert!(result.unwrap_err().to_string().contains("late failure"));
    }
}
