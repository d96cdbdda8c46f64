//! Collection point for link errors that shouldn't abort the phase that found
//! them. The scanner and the relocation applier in particular try to surface
//! as many problems per section as they can, so they push here and keep
//! going. Workers report concurrently, hence the lock-free queue; once all
//! phases have run, `finish` prints everything collected and decides the
//! exit status.

use crate::error::Error;
use crate::error::Result;
use crate::error::bail;
use crossbeam_queue::SegQueue;

pub(crate) struct ErrorSink {
    errors: SegQueue<Error>,
}

impl ErrorSink {
    pub(crate) fn new() -> ErrorSink {
        ErrorSink {
            errors: SegQueue::new(),
        }
    }

    /// Records a non-fatal link error. The link will fail, but whatever phase
    /// we're in continues so that we surface as many errors as possible.
    pub(crate) fn report(&self, error: Error) {
        self.errors.push(error);
    }

    pub(crate) fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Drains and prints every accumulated error. Fails the link if there
    /// were any.
    pub(crate) fn finish(&self) -> Result {
        let n = self.errors.len();
        if n == 0 {
            return Ok(());
        }
        while let Some(error) = self.errors.pop() {
            tracing::error!("{error:#}");
        }
        bail!("link failed with {n} error(s)");
    }
}
