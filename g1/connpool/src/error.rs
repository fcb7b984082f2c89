use std::error;
use std::io;
use std::time::Duration;

use snafu::prelude::*;

use crate::Id;

/// Errors of pool operations.
///
/// `E` is the error type of the caller-supplied connect function.
#[derive(Debug, Snafu)]
pub enum Error<E>
where
    E: error::Error + 'static,
{
    #[snafu(display("pool closed"))]
    Closed,
    #[snafu(display("create resource error: {source}"))]
    Create { source: E },
    #[snafu(display("acquire timeout: {timeout:?}"))]
    Timeout { timeout: Duration },
    #[snafu(display("invalid release: resource {id} does not belong to this pool"))]
    InvalidRelease { id: Id },
}

impl<E> From<Error<E>> for io::Error
where
    E: error::Error + Send + Sync + 'static,
{
    fn from(error: Error<E>) -> Self {
        match error {
            Error::Closed => io::Error::new(io::ErrorKind::NotConnected, error),
            Error::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, error),
            Error::InvalidRelease { .. } => io::Error::new(io::ErrorKind::InvalidInput, error),
            Error::Create { .. } => io::Error::other(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn display() {
        assert_eq!(Error::<io::Error>::Closed.to_string(), "pool closed");
        assert_eq!(
            Error::<io::Error>::Timeout {
                timeout: Duration::from_secs(3),
            }
            .to_string(),
            "acquire timeout: 3s",
        );
        assert_eq!(
            Error::<io::Error>::InvalidRelease { id: 7 }.to_string(),
            "invalid release: resource 7 does not belong to this pool",
        );

        let error = Error::Create {
            source: io::Error::other("connection refused"),
        };
        assert_eq!(
            error.to_string(),
            "create resource error: connection refused",
        );
        assert_eq!(error.source().unwrap().to_string(), "connection refused");
    }

    #[test]
    fn into_io_error() {
        let error: io::Error = Error::<io::Error>::Closed.into();
        assert_eq!(error.kind(), io::ErrorKind::NotConnected);

        let error: io::Error = Error::<io::Error>::Timeout {
            timeout: Duration::from_secs(1),
        }
        .into();
        assert_eq!(error.kind(), io::ErrorKind::TimedOut);

        let error: io::Error = Error::<io::Error>::InvalidRelease { id: 0 }.into();
        assert_eq!(error.kind(), io::ErrorKind::InvalidInput);

        let error: io::Error = Error::Create {
            source: io::Error::other("refused"),
        }
        .into();
        assert_eq!(error.kind(), io::ErrorKind::Other);
    }
}
