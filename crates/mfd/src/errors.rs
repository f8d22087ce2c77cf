use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MfdError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Another writer already holds this file")]
    WriterActive,

    #[error("Bad stream signature: found {found:#018x}")]
    BadSignature { found: u64 },

    #[error("File too short to hold a stream header: {len} bytes")]
    TruncatedHeader { len: u64 },

    #[error("{op} failed: {source}")]
    Wait {
        op: &'static str,
        source: io::Error,
    },

    #[error("Notification channel closed by the notifier")]
    NotifyClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err = MfdError::IoError(io_err);
        assert_eq!(
            err.to_string(),
            "IO error: file not found",
            "IoError should display with 'IO error:' prefix"
        );

        let err = MfdError::WriterActive;
        assert_eq!(
            err.to_string(),
            "Another writer already holds this file",
            "WriterActive should display correct message"
        );

        let err = MfdError::BadSignature { found: 0x1234 };
        assert_eq!(
            err.to_string(),
            "Bad stream signature: found 0x0000000000001234",
            "BadSignature should display the found value in hex"
        );

        let err = MfdError::TruncatedHeader { len: 10 };
        assert_eq!(
            err.to_string(),
            "File too short to hold a stream header: 10 bytes",
            "TruncatedHeader should display the offending length"
        );

        let err = MfdError::Wait {
            op: "FUTEX_WAIT",
            source: io::Error::from_raw_os_error(libc::EFAULT),
        };
        assert!(
            err.to_string().starts_with("FUTEX_WAIT failed: "),
            "Wait should name the failing operation, got: {}",
            err
        );

        let err = MfdError::NotifyClosed;
        assert_eq!(
            err.to_string(),
            "Notification channel closed by the notifier",
            "NotifyClosed should display correct message"
        );
    }

    #[test]
    fn test_error_conversion_from_io_error() {
        // Test automatic conversion from io::Error using the From trait
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: MfdError = io_err.into();

        match err {
            MfdError::IoError(e) => {
                assert_eq!(e.kind(), io::ErrorKind::PermissionDenied);
                assert_eq!(e.to_string(), "access denied");
            }
            _ => panic!("Expected IoError variant"),
        }

        // Test that the #[from] attribute enables ? operator
        fn returns_io_error() -> Result<(), io::Error> {
            Err(io::Error::other("test error"))
        }

        fn uses_question_mark() -> Result<(), MfdError> {
            returns_io_error()?;
            Ok(())
        }

        let result = uses_question_mark();
        assert!(result.is_err(), "Should propagate io::Error as MfdError");
        match result.unwrap_err() {
            MfdError::IoError(e) => assert_eq!(e.to_string(), "test error"),
            _ => panic!("Expected IoError variant"),
        }
    }
}
