use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError, channel};
use std::time::Duration;

use crate::error::RunError;

/// The final outcome of a run.
pub type Outcome<R> = Result<R, RunError<R>>;

/// Called exactly once with the final outcome of a run.
pub(crate) type Finish<R> = Box<dyn FnOnce(Outcome<R>) + Send>;

/// Completion channel of a run that is already under way.
///
/// Starting a run never blocks; the caller decides when to wait for the
/// outcome, which is delivered exactly once.
#[derive(Debug)]
pub struct RunHandle<R> {
    receiver: Receiver<Outcome<R>>,
}

impl<R> RunHandle<R>
where
    R: Send + 'static,
{
    /// Creates a handle together with the callback that resolves it.
    pub(crate) fn channel() -> (Finish<R>, Self) {
        let (sender, receiver) = channel();

        let finish: Finish<R> = Box::new(move |outcome| {
            // The handle may already be gone; nobody is waiting then.
            let _ = sender.send(outcome);
        });

        (finish, Self { receiver })
    }
}

impl<R> RunHandle<R> {
    /// Blocks until the run delivers its outcome.
    pub fn wait(self) -> Outcome<R> {
        self.receiver.recv().unwrap_or_else(|_| Err(abandoned()))
    }

    /// Blocks for at most `timeout`. Returns `None` if the run is still going.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome<R>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Returns the outcome if the run has already finished.
    pub fn try_wait(&self) -> Option<Outcome<R>> {
        match self.receiver.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

fn abandoned<R>() -> RunError<R> {
    RunError::Abandoned {
        unit: String::from("run"),
    }
}
