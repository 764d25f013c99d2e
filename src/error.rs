//! Crate wide error type and the `err_at!` macro used to construct it.

use std::{ffi, fmt, result};

/// Error variants that can be returned by this package.
///
/// Each variant carries a `file:line` location (stamped by [err_at]) followed by
/// a human readable message.
pub enum Error {
    IOError(String, String),
    InvalidFile(String, String),
    InvalidInput(String, String),
    InvalidFormat(String, String),
    DecodeFail(String, String),
    IPCFail(String, String),
    ThreadFail(String, String),
    Fatal(String, String),
    FailConvert(String, String),
    KeyNotFound(String, String),
    Exists(String, String),
    Stale(String, String),
    NotImplemented(String, String),
    Timeout(String, String),
    APIMisuse(String, String),
    Disconnected(String, String),
    NotMounted(String, String),
    MountExists(String, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match self {
            IOError(p, msg) => write!(f, "IOError:{} {}", p, msg),
            InvalidFile(p, msg) => write!(f, "InvalidFile:{} {}", p, msg),
            InvalidInput(p, msg) => write!(f, "InvalidInput:{} {}", p, msg),
            InvalidFormat(p, msg) => write!(f, "InvalidFormat:{} {}", p, msg),
            DecodeFail(p, msg) => write!(f, "DecodeFail:{} {}", p, msg),
            IPCFail(p, msg) => write!(f, "IPCFail:{} {}", p, msg),
            ThreadFail(p, msg) => write!(f, "ThreadFail:{} {}", p, msg),
            Fatal(p, msg) => write!(f, "Fatal:{} {}", p, msg),
            FailConvert(p, msg) => write!(f, "FailConvert:{} {}", p, msg),
            KeyNotFound(p, msg) => write!(f, "KeyNotFound:{} {}", p, msg),
            Exists(p, msg) => write!(f, "Exists:{} {}", p, msg),
            Stale(p, msg) => write!(f, "Stale:{} {}", p, msg),
            NotImplemented(p, msg) => write!(f, "NotImplemented:{} {}", p, msg),
            Timeout(p, msg) => write!(f, "Timeout:{} {}", p, msg),
            APIMisuse(p, msg) => write!(f, "APIMisuse:{} {}", p, msg),
            Disconnected(p, msg) => write!(f, "Disconnected:{} {}", p, msg),
            NotMounted(p, msg) => write!(f, "NotMounted:{} {}", p, msg),
            MountExists(p, msg) => write!(f, "MountExists:{} {}", p, msg),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for Error {}

impl Clone for Error {
    fn clone(&self) -> Error {
        use Error::*;

        match self {
            IOError(p, msg) => IOError(p.clone(), msg.clone()),
            InvalidFile(p, msg) => InvalidFile(p.clone(), msg.clone()),
            InvalidInput(p, msg) => InvalidInput(p.clone(), msg.clone()),
            InvalidFormat(p, msg) => InvalidFormat(p.clone(), msg.clone()),
            DecodeFail(p, msg) => DecodeFail(p.clone(), msg.clone()),
            IPCFail(p, msg) => IPCFail(p.clone(), msg.clone()),
            ThreadFail(p, msg) => ThreadFail(p.clone(), msg.clone()),
            Fatal(p, msg) => Fatal(p.clone(), msg.clone()),
            FailConvert(p, msg) => FailConvert(p.clone(), msg.clone()),
            KeyNotFound(p, msg) => KeyNotFound(p.clone(), msg.clone()),
            Exists(p, msg) => Exists(p.clone(), msg.clone()),
            Stale(p, msg) => Stale(p.clone(), msg.clone()),
            NotImplemented(p, msg) => NotImplemented(p.clone(), msg.clone()),
            Timeout(p, msg) => Timeout(p.clone(), msg.clone()),
            APIMisuse(p, msg) => APIMisuse(p.clone(), msg.clone()),
            Disconnected(p, msg) => Disconnected(p.clone(), msg.clone()),
            NotMounted(p, msg) => NotMounted(p.clone(), msg.clone()),
            MountExists(p, msg) => MountExists(p.clone(), msg.clone()),
        }
    }
}

/// Crate wide result type, parameterized over [Error].
pub type Result<T> = result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        Error::IOError("std::io".to_string(), err.to_string())
    }
}

impl From<ffi::OsString> for Error {
    fn from(err: ffi::OsString) -> Error {
        Error::InvalidFile("std::ffi".to_string(), format!("{:?}", err))
    }
}

/// Construct an [Error] value, tagging it with the call-site's `file:line`.
///
/// Three forms are supported:
///
/// * `err_at!(Variant, expr)` — evaluate `expr` (a `Result<T, E>` where
///   `E: ToString`), pass through `Ok(T)`, wrap `Err(E)` as `Error::Variant`.
/// * `err_at!(Variant, msg: "fmt", args...)` — always constructs `Err(Error::Variant)`
///   with a formatted message, for call sites with no underlying `Result`.
/// * `err_at!(Variant, expr, "fmt", args...)` — like the first form but replaces
///   the error's message with the formatted string instead of `E::to_string()`.
#[macro_export]
macro_rules! err_at {
    ($v:ident, msg: $($arg:expr),+) => {{
        let prefix = format!("{}:{}", file!(), line!());
        Err($crate::Error::$v(prefix, format!($($arg),+)))
    }};
    ($v:ident, $e:expr) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(err) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, err.to_string()))
            }
        }
    }};
    ($v:ident, $e:expr, $($arg:expr),+) => {{
        match $e {
            Ok(val) => Ok(val),
            Err(_) => {
                let prefix = format!("{}:{}", file!(), line!());
                Err($crate::Error::$v(prefix, format!($($arg),+)))
            }
        }
    }};
}
