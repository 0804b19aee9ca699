// Licensed under the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>
// or the Apache License, Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>,
// at your option. This file may not be copied, modified, or distributed
// except according to those terms.

use std::io;

use thiserror::Error;

/// Every fallible operation in this crate returns this error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("queue is full")]
    QueueFull,

    #[error("queue is closed")]
    QueueClosed,

    #[error("operation would block")]
    WouldBlock,

    #[error("operation timed out")]
    Timeout,

    #[error("no route to the requested peer")]
    NoRoute,

    #[error("invalid address: {0}")]
    BadAddress(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(&'static str),

    #[error("frame rejected as a replay")]
    ReplayRejected,

    #[error("not found")]
    NotFound,

    #[error("frame of {size} bytes exceeds the configured maximum of {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors that only reflect a transient condition the caller
    /// may retry (as opposed to a permanently broken queue or route).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::WouldBlock | Error::Timeout | Error::QueueFull)
    }
}
