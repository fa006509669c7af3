// src/context.rs
//! Context extension traits and macros for error handling.
//!
//! `.context()` / `.with_context()` on `Result` and `Option`, plus `bail!` and `ensure!`.
//! Lazy variants only evaluate their closure on the error path.

use crate::error::{Error, Result};

/// Extension trait giving `.context()` / `.with_context()` on any `Result`
/// whose error converts into the crate [`Error`].
pub trait Context<T, E> {
    /// Add static or owned context (eager, use only when cheap).
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    /// Add context lazily (closure only runs on error path).
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<Error>,
{
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| err.into().context(f()))
    }
}

/// Extension trait for `Option<T>` to `Result<T, Error>` with context.
pub trait OptionContext<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T> OptionContext<T> for Option<T> {
    #[inline]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(context))
    }

    #[inline]
    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.ok_or_else(|| Error::custom(f()))
    }
}

// ====================== CONVENIENCE MACROS ======================

/// Early return with an error: `bail!("msg")`, `bail!(err)` or formatted.
#[macro_export]
macro_rules! bail {
    ($msg:literal $(,)?) => {
        return Err($crate::error::Error::msg($msg))
    };
    ($err:expr $(,)?) => {
        return Err(Into::<$crate::error::Error>::into($err))
    };
    ($fmt:expr, $($arg:tt)*) => {
        return Err($crate::error::Error::format(format_args!($fmt, $($arg)*)))
    };
}

/// Ensure a condition is true, else `bail!`.
#[macro_export]
macro_rules! ensure {
    ($cond:expr, $msg:literal $(,)?) => {
        if !($cond) {
            $crate::bail!($msg);
        }
    };
    ($cond:expr, $fmt:expr, $($arg:tt)*) => {
        if !($cond) {
            $crate::bail!($fmt, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_extent(text: &str) -> Result<u32> {
        let value: u32 = text
            .trim()
            .parse()
            .map_err(|_| Error::custom(format!("not a number: {text}")))?;
        crate::ensure!(value > 0, "extent must be positive, got {}", value);
        Ok(value)
    }

    #[test]
    fn test_ensure_formats_message() {
        assert_eq!(parse_extent(" 12 ").unwrap(), 12);
        let err = parse_extent("0").unwrap_err();
        assert_eq!(err.to_string(), "extent must be positive, got 0");
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u8> = None;
        let err = missing.context("no sampler bound").unwrap_err();
        assert!(err.is_custom());
        assert_eq!(Some(3u8).with_context(|| "unused").unwrap(), 3);
    }

    #[test]
    fn test_result_context_wraps() {
        let io: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = io.with_context(|| format!("reading {}", "scene.json")).unwrap_err();
        assert!(err.is_io());
        assert!(err.to_string().starts_with("reading scene.json"));
    }
}
