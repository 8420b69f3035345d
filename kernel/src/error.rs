//! Kernel error codes for bekOS.
//!
//! A single closed enum covers every user-visible failure. Syscall handlers
//! return `SysResult<i64>`; the dispatcher negates the code into the
//! caller's return register. Internal subsystems use the same enum so that
//! failures propagate to userspace without translation layers.

use core::fmt;

/// User-visible error codes, stable across the syscall ABI.
///
/// Discriminants follow the numbering of the error-code table (success is
/// 0 and is represented by `Ok`, never by a variant).
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum SysError {
    /// EACCES: permission denied.
    PermissionDenied = 1,
    /// EADDRINUSE: address already in use.
    AddressInUse = 2,
    /// EAGAIN: resource temporarily unavailable.
    TryAgain = 3,
    /// EBADF: bad entity handle slot.
    BadHandle = 4,
    /// ECHILD: no child processes.
    NoChild = 5,
    /// EEXIST: file exists.
    Exists = 6,
    /// EFAIL: failed for unknown reason.
    Failed = 7,
    /// EFAULT: bad address.
    BadAddress = 8,
    /// EFBIG: file too large.
    FileTooBig = 9,
    /// EINVAL: invalid argument.
    InvalidArgument = 10,
    /// EIO: input/output error.
    IoError = 11,
    /// ENODEV: no such device.
    NoSuchDevice = 12,
    /// ENOENT: no file or directory.
    NoEntry = 13,
    /// ENOEXEC: exec format error.
    ExecFormat = 14,
    /// ENOMEM: not enough space.
    OutOfMemory = 15,
    /// ENOTDIR: not a directory.
    NotADirectory = 16,
    /// ENOTSUP: operation not supported.
    NotSupported = 17,
    /// EOVERFLOW: value too large to be stored in data type.
    Overflow = 18,
    /// EPERM: operation not permitted.
    NotPermitted = 19,
    /// ERANGE: result too large.
    OutOfRange = 20,
    /// ESPIPE: invalid seek.
    InvalidSeek = 21,
}

impl SysError {
    /// Positive ABI code of this error.
    pub const fn code(self) -> i64 {
        self as i64
    }

    /// Encoding used in the syscall return register.
    pub const fn to_return_value(self) -> i64 {
        -(self as i64)
    }

    /// Decode a positive ABI code.
    pub fn from_code(code: i64) -> Option<Self> {
        Some(match code {
            1 => Self::PermissionDenied,
            2 => Self::AddressInUse,
            3 => Self::TryAgain,
            4 => Self::BadHandle,
            5 => Self::NoChild,
            6 => Self::Exists,
            7 => Self::Failed,
            8 => Self::BadAddress,
            9 => Self::FileTooBig,
            10 => Self::InvalidArgument,
            11 => Self::IoError,
            12 => Self::NoSuchDevice,
            13 => Self::NoEntry,
            14 => Self::ExecFormat,
            15 => Self::OutOfMemory,
            16 => Self::NotADirectory,
            17 => Self::NotSupported,
            18 => Self::Overflow,
            19 => Self::NotPermitted,
            20 => Self::OutOfRange,
            21 => Self::InvalidSeek,
            _ => return None,
        })
    }
}

impl fmt::Display for SysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let description = match self {
            Self::PermissionDenied => "permission denied",
            Self::AddressInUse => "address already in use",
            Self::TryAgain => "resource temporarily unavailable",
            Self::BadHandle => "bad entity handle slot",
            Self::NoChild => "no child processes",
            Self::Exists => "file exists",
            Self::Failed => "failed for unknown reason",
            Self::BadAddress => "bad address",
            Self::FileTooBig => "file too large",
            Self::InvalidArgument => "invalid argument",
            Self::IoError => "input/output error",
            Self::NoSuchDevice => "no such device",
            Self::NoEntry => "no file or directory",
            Self::ExecFormat => "exec format error",
            Self::OutOfMemory => "not enough space",
            Self::NotADirectory => "not a directory",
            Self::NotSupported => "operation not supported",
            Self::Overflow => "value too large to be stored in data type",
            Self::NotPermitted => "operation not permitted",
            Self::OutOfRange => "result too large",
            Self::InvalidSeek => "invalid seek",
        };
        f.write_str(description)
    }
}

/// Result type alias for kernel operations.
pub type SysResult<T> = Result<T, SysError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_value_is_negated_code() {
        assert_eq!(SysError::BadAddress.to_return_value(), -8);
        assert_eq!(SysError::InvalidSeek.to_return_value(), -21);
    }

    #[test]
    fn codes_round_trip() {
        for code in 1..=21 {
            let err = SysError::from_code(code).unwrap();
            assert_eq!(err.code(), code);
        }
        assert!(SysError::from_code(0).is_none());
        assert!(SysError::from_code(22).is_none());
    }
}
