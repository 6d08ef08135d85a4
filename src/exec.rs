// exec.rs — synchronous vs asynchronous execution.
//
// Every operation that can be enqueued takes an `Exec` argument:
//
//   Exec::Sync           — block until the device has finished and the
//                          result is visible to the next call.
//   Exec::Async(&stream) — enqueue on `stream` and return immediately. The
//                          result is only guaranteed after
//                          `stream.synchronize()`.
//
// Operations on the same stream run in enqueue order. Nothing is promised
// between different streams, or between a stream and synchronous calls,
// without an explicit `synchronize()` in between.

use crate::error::Result;

/// Execution mode of one operation. `S` is the backend's stream type.
#[derive(Debug)]
pub enum Exec<'s, S> {
    Sync,
    Async(&'s S),
}

// Derived Clone/Copy would require `S: Copy`; the variant only holds a reference.
impl<S> Clone for Exec<'_, S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for Exec<'_, S> {}

impl<'s, S> Exec<'s, S> {
    pub fn is_async(&self) -> bool {
        matches!(self, Exec::Async(_))
    }
}

impl<'s, S> From<Option<&'s S>> for Exec<'s, S> {
    fn from(stream: Option<&'s S>) -> Self {
        match stream {
            Some(s) => Exec::Async(s),
            None => Exec::Sync,
        }
    }
}

/// An ordering context for asynchronous device work.
pub trait Stream: Send + Sync {
    /// Block until everything enqueued on this stream has completed.
    ///
    /// # Errors
    /// Reports the first failure of an enqueued operation.
    fn synchronize(&self) -> Result<()>;

    /// `true` when no enqueued work is outstanding. Never blocks.
    fn is_idle(&self) -> bool;
}
