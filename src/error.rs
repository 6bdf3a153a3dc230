// Crate-wide error taxonomy, grouped by kind rather than individual cause:
// value errors are caller mistakes, connection errors are link-level
// failures, bad-block/format/bring-up are domain specific.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SC64Error {
    /// Caller-provided argument violates a stated precondition (length, range, alignment).
    #[error("{0}")]
    Value(String),

    /// Link desynchronization, wrong command letter, timeout, device ERR frame,
    /// or a flash verify mismatch.
    #[error("{0}")]
    Connection(String),

    /// A 64DD image access landed on a bad/missing block.
    #[error("bad block")]
    BadBlock,

    /// Update-image container is malformed (bad token, CRC, chunk length, or id).
    #[error("{0}")]
    Format(String),

    /// Board bring-up aborted: STM32 NACK, primer CRC/id mismatch, or verify failure.
    #[error("{0}")]
    BringUp(String),
}

impl SC64Error {
    pub fn value(msg: impl Into<String>) -> Self {
        SC64Error::Value(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        SC64Error::Connection(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        SC64Error::Format(msg.into())
    }

    pub fn bring_up(msg: impl Into<String>) -> Self {
        SC64Error::BringUp(msg.into())
    }
}

impl From<std::io::Error> for SC64Error {
    fn from(e: std::io::Error) -> Self {
        SC64Error::Connection(e.to_string())
    }
}

impl From<serialport::Error> for SC64Error {
    fn from(e: serialport::Error) -> Self {
        SC64Error::Connection(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SC64Error>;
