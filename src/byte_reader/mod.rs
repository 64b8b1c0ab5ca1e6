pub(crate) mod buffered;
mod slice;

pub use slice::SliceReader;

use crate::errors::{Error, Result};

/// Byte offset into a source. All reader positions and sizes use it.
pub type Position = u64;

/// A pull-based reader over a byte source.
///
/// A reader keeps a window of bytes available without further I/O. `pull`
/// widens the window, `available`/`consume` walk it without copying, and
/// `read`/`skip` combine the two. Failures latch: after the first error the
/// reader stays unhealthy and every later call returns the stored status.
/// End of source is not a failure; the source may grow between calls.
pub trait ByteReader {
    /// Ensures at least `min_length` bytes are available in the window.
    ///
    /// Returns `Ok(true)` when the window holds at least `min_length` bytes,
    /// `Ok(false)` when the source ends first (the reader stays healthy).
    fn pull(&mut self, min_length: usize) -> Result<bool>;

    /// The bytes currently available without I/O. Empty when the reader is
    /// not open.
    fn available(&self) -> &[u8];

    /// Advances past `amount` bytes of the window.
    ///
    /// `amount` must not exceed `available().len()`.
    fn consume(&mut self, amount: usize);

    /// Fills `dest`, short only at end of source. Reading zero bytes always
    /// succeeds and does not move the position.
    fn read(&mut self, dest: &mut [u8]) -> Result<usize>;

    /// Appends up to `length` bytes to `dest`, short only at end of source.
    fn read_to_vec(&mut self, length: usize, dest: &mut Vec<u8>) -> Result<usize>;

    /// Advances the position without copying, short only at end of source.
    fn skip(&mut self, length: u64) -> Result<u64>;

    /// The current read offset.
    fn pos(&self) -> Position;

    /// Whether `seek` and `size` are supported.
    fn supports_random_access(&self) -> bool {
        false
    }

    /// Moves the window to `new_pos`. Seeking exactly to the end of the
    /// source succeeds; seeking past it fails.
    fn seek(&mut self, _new_pos: Position) -> Result<()> {
        Err(Error::FailedPrecondition(
            "reader does not support random access".to_string(),
        ))
    }

    /// Total size of the source.
    fn size(&mut self) -> Result<Position> {
        Err(Error::FailedPrecondition(
            "reader does not support random access".to_string(),
        ))
    }

    /// True while further operations may succeed: the reader is open, or was
    /// closed without a pending failure.
    fn healthy(&self) -> bool;

    /// Finalizes the reader. Idempotent; the position is unchanged.
    fn close(&mut self) -> Result<()>;
}

/// Reader lifecycle; shared by every reader in the crate.
///
/// Open -> Failed on the first error, Open -> Closed via `close`. Failed is
/// terminal for reads but keeps the original status; a close on a failed
/// reader records that status instead of masking it.
#[derive(Debug, Clone)]
enum State {
    Open,
    Closed { error: Option<Error> },
    Failed { error: Error },
}

#[derive(Debug, Clone)]
pub(crate) struct Health {
    state: State,
}

impl Health {
    pub(crate) fn open() -> Self {
        Health { state: State::Open }
    }

    /// The state of a default-constructed reader: already closed, close is a
    /// no-op.
    pub(crate) fn closed() -> Self {
        Health {
            state: State::Closed { error: None },
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        matches!(self.state, State::Open)
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed { .. })
    }

    pub(crate) fn healthy(&self) -> bool {
        matches!(
            self.state,
            State::Open | State::Closed { error: None }
        )
    }

    /// Fails unless the reader is open; a failed reader surfaces its stored
    /// status again.
    pub(crate) fn ensure_open(&self) -> Result<()> {
        match &self.state {
            State::Open => Ok(()),
            State::Closed { .. } => Err(Error::Closed),
            State::Failed { error } => Err(error.clone()),
        }
    }

    /// Latches the first failure; later failures keep the original status.
    /// Returns the error for direct propagation.
    pub(crate) fn fail(&mut self, error: Error) -> Error {
        if matches!(self.state, State::Open) {
            self.state = State::Failed {
                error: error.clone(),
            };
        }
        error
    }

    /// Failed -> Open, used by recovery.
    pub(crate) fn reopen(&mut self) {
        if matches!(self.state, State::Failed { .. }) {
            self.state = State::Open;
        }
    }

    /// Transitions to Closed. A second close is a no-op returning `Ok`. An
    /// earlier failure is carried into the closed state and reported instead
    /// of `error`.
    pub(crate) fn close_with(&mut self, error: Option<Error>) -> Result<()> {
        match &self.state {
            State::Closed { .. } => Ok(()),
            State::Failed { error: earlier } => {
                let earlier = earlier.clone();
                self.state = State::Closed {
                    error: Some(earlier.clone()),
                };
                Err(earlier)
            }
            State::Open => {
                self.state = State::Closed {
                    error: error.clone(),
                };
                match error {
                    None => Ok(()),
                    Some(error) => Err(error),
                }
            }
        }
    }
}
