use std::io;

/// A centralized error type for reactor and poller operations.
#[derive(thiserror::Error, Debug)]
pub enum IoError {
    /// The OS rejected an argument, e.g. registering a file descriptor
    /// that does not support readiness polling.
    #[error("invalid argument passed to the poller")]
    InvalidArgument,

    /// The file descriptor is not known to the poller.
    #[error("no such file descriptor")]
    NotFound,

    /// The operation would block. Never produced by `wait` (which blocks);
    /// on individual I/O calls this is part of the normal readiness
    /// protocol rather than a failure.
    #[error("operation would block")]
    WouldBlock,

    /// A signal interrupted the call. `wait` absorbs this internally and
    /// reports a spurious zero-event return instead.
    #[error("interrupted by a signal")]
    Interrupted,

    /// Any other I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl IoError {
    /// Classify the most recent OS error for the calling thread.
    pub(crate) fn last_os_error() -> IoError {
        IoError::classify(io::Error::last_os_error())
    }

    pub(crate) fn classify(err: io::Error) -> IoError {
        match err.raw_os_error() {
            Some(libc::EINVAL) => IoError::InvalidArgument,
            Some(libc::ENOENT) | Some(libc::EBADF) => IoError::NotFound,
            Some(libc::EAGAIN) => IoError::WouldBlock,
            Some(libc::EINTR) => IoError::Interrupted,
            _ => IoError::Io(err),
        }
    }
}

// Tests compare errors by kind; `io::Error` itself is not `PartialEq`.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidArgument, Self::InvalidArgument) => true,
            (Self::NotFound, Self::NotFound) => true,
            (Self::WouldBlock, Self::WouldBlock) => true,
            (Self::Interrupted, Self::Interrupted) => true,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}
