//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for Segline.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct SeglineError(pub String);

impl SeglineError {
    /// Creates an error from an arbitrary displayable message.
    pub fn msg(m: impl fmt::Display) -> Self {
        SeglineError(m.to_string())
    }
}

impl fmt::Display for SeglineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl std::error::Error for SeglineError {}

// Helper macro for saving boiler-plate `impl From<T>`s for transparent
// conversion from various common error types to `SeglineError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for SeglineError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                SeglineError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::mpsc::error::TryRecvError);
impl_from_error!(tokio::task::JoinError);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = SeglineError("what the heck?".into());
        assert_eq!(format!("{}", e), String::from("what the heck?"));
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = SeglineError::from(io_error);
        assert!(e.0.contains("oh no!"));
    }
}
