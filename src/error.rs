// SPDX-License-Identifier: Apache-2.0

//! Error conditions surfaced by the signing pipeline.
//!
//! Every error is fail-fast: the pipeline aborts before the output file is
//! finalized and nothing is retried or downgraded.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Errors produced while measuring and signing an enclave image.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input: ELF structure, PEM/ASN.1 key material or the
    /// `.note.sgxmeta` metadata slot.
    Format(String),

    /// Input that parses but violates a constraint: misaligned or
    /// out-of-range configuration, a disallowed relocation type, an
    /// undefined symbol, an unexpected RSA exponent, or a catsig
    /// unsigned/signed mismatch.
    Validation(String),

    /// A fixed budget was exceeded: the metadata blob capacity or the
    /// maximum enclave size.
    Capacity(String),

    /// Signature creation or verification failed.
    Crypto(String),

    /// An I/O failure while reading or writing files.
    Io(io::Error),
}

impl Error {
    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Error::Format(msg.into())
    }

    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub(crate) fn capacity(msg: impl Into<String>) -> Self {
        Error::Capacity(msg.into())
    }

    pub(crate) fn crypto(msg: impl Into<String>) -> Self {
        Error::Crypto(msg.into())
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "invalid format: {}", msg),
            Error::Validation(msg) => write!(f, "validation failed: {}", msg),
            Error::Capacity(msg) => write!(f, "capacity exceeded: {}", msg),
            Error::Crypto(msg) => write!(f, "crypto failure: {}", msg),
            Error::Io(err) => write!(f, "i/o failure: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
