// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Umbrella error type for callers who don't want to match on the
//! per-module error enums individually.

use std::fmt;
use std::io;

use crate::fd;
use crate::io_manager;

/// Top-level error type returned by the parts of the public API that can
/// fail for more than one reason.
#[derive(Debug)]
pub enum Error {
    /// Failure in the readiness reactor or the fd-context table.
    Io(io_manager::Error),
    /// Failure in the fd-context table specifically.
    Fd(fd::Error),
    /// Opaque OS error (thread spawn, mmap, epoll_create, ...).
    Os(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "{e}"),
            Error::Fd(e) => write!(f, "{e}"),
            Error::Os(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Fd(e) => Some(e),
            Error::Os(e) => Some(e),
        }
    }
}

impl From<io_manager::Error> for Error {
    fn from(e: io_manager::Error) -> Self {
        Error::Io(e)
    }
}

impl From<fd::Error> for Error {
    fn from(e: fd::Error) -> Self {
        Error::Fd(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Os(e)
    }
}

/// Result alias used throughout the public API.
pub type Result<T> = std::result::Result<T, Error>;
