//! Helper macros for logging (console printing).

/// Log TRACE message.
///
/// Example:
/// ```no_run
/// use segline::pf_trace;
/// let msg = "hello";
/// pf_trace!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($fmt_str:literal) => {
        log::trace!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::trace!($fmt_str, $($fmt_arg)*)
    };
}

/// Log DEBUG message.
///
/// Example:
/// ```no_run
/// use segline::pf_debug;
/// let msg = "hello";
/// pf_debug!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_debug {
    ($fmt_str:literal) => {
        log::debug!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::debug!($fmt_str, $($fmt_arg)*)
    };
}

/// Log INFO message.
///
/// Example:
/// ```no_run
/// use segline::pf_info;
/// let msg = "hello";
/// pf_info!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($fmt_str:literal) => {
        log::info!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::info!($fmt_str, $($fmt_arg)*)
    };
}

/// Log WARN message.
///
/// Example:
/// ```no_run
/// use segline::pf_warn;
/// let msg = "hello";
/// pf_warn!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_warn {
    ($fmt_str:literal) => {
        log::warn!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::warn!($fmt_str, $($fmt_arg)*)
    };
}

/// Log ERROR message.
///
/// Example:
/// ```no_run
/// use segline::pf_error;
/// let msg = "hello";
/// pf_error!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! pf_error {
    ($fmt_str:literal) => {
        log::error!($fmt_str)
    };

    ($fmt_str:literal, $($fmt_arg:tt)*) => {
        log::error!($fmt_str, $($fmt_arg)*)
    };
}

/// Log an error string to logger and then return a `SeglineError` containing
/// the string.
///
/// Example:
/// ```no_run
/// use segline::{logged_err, pf_error};
/// let msg = "hello";
/// let e: Result<(), segline::SeglineError> = logged_err!("got {} to print", msg);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($fmt_str:literal) => {{
        pf_error!($fmt_str);
        Err($crate::SeglineError($fmt_str.into()))
    }};

    ($fmt_str:literal, $($fmt_arg:tt)*) => {{
        pf_error!($fmt_str, $($fmt_arg)*);
        Err($crate::SeglineError(format!(
            $fmt_str,
            $($fmt_arg)*
        )))
    }};
}

#[cfg(test)]
mod print_tests {
    use crate::utils::SeglineError;

    #[test]
    fn error_no_args() {
        let e: Result<(), SeglineError> = logged_err!("interesting message");
        assert_eq!(e, Err(SeglineError("interesting message".into())));
    }

    #[test]
    fn error_with_args() {
        let e: Result<(), SeglineError> = logged_err!("got {} to print", 777);
        assert_eq!(e, Err(SeglineError("got 777 to print".into())));
    }
}
