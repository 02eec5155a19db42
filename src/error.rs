use thiserror::Error;

/// An error
///
/// Every variant stays local to the smallest unit that can contain it
/// (one record, one channel, one direction) and never unwinds past the
/// connection boundary; the dissection degrades instead of aborting.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("parse ssh packet, {0}")]
    Nom(String),

    #[error("key material length {0} invalid")]
    InvalidKeyLength(usize),

    #[error("curve25519 computation yielded a low-order result")]
    CurveComputation,

    #[error("implausible packet length {0}")]
    OversizedLength(u32),

    #[error("data for unknown channel {0}")]
    UnknownChannel(u32),

    #[error("keylog: {0}")]
    Keylog(String),

    #[error("{0}")]
    Unsupported(String),
}

impl<I: std::fmt::Debug> From<nom::Err<nom::error::Error<I>>> for Error {
    fn from(err: nom::Err<nom::error::Error<I>>) -> Self {
        Error::Nom(err.to_string())
    }
}
