//! Kernel error codes
//!
//! Errors cross the syscall boundary as negative values in `rax`, so the
//! enum carries its wire encoding directly. Everything in-kernel passes
//! `Result` and lets `?` do the plumbing; the syscall router folds the
//! error into the return register at the very end.

use core::fmt;

/// Error returned by kernel operations and system calls.
///
/// The discriminants are the wire values user space sees (negated kernel
/// error numbers). They form a single flat namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum KernErr {
    /// Unspecified or unknown problem.
    Unspecified = -1,
    /// Task identifier is stale or unknown, or the caller lacks permission.
    BadTask = -2,
    /// Malformed argument: bad alignment, range, or flag set.
    Inval = -3,
    /// Out of physical frames or page-table memory.
    NoMem = -4,
    /// The task table is full.
    NoFreeTask = -5,
    /// IPC target is not currently blocked in `ipc_recv`.
    IpcNotRecv = -6,
    /// Transient failure: the signal queue is full, try again.
    Again = -7,
    /// Initial program image is malformed.
    InvalidExe = -8,
    /// Unknown system call number.
    NoSys = -9,
}

impl KernErr {
    /// Wire value as written to the syscall return register.
    pub const fn code(self) -> i64 {
        self as i64
    }
}

impl fmt::Display for KernErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KernErr::Unspecified => "unspecified error",
            KernErr::BadTask => "bad task id",
            KernErr::Inval => "invalid argument",
            KernErr::NoMem => "out of memory",
            KernErr::NoFreeTask => "task table full",
            KernErr::IpcNotRecv => "target not receiving",
            KernErr::Again => "try again",
            KernErr::InvalidExe => "invalid executable",
            KernErr::NoSys => "no such syscall",
        };
        f.write_str(name)
    }
}

/// Result type carried by every syscall implementation.
pub type SysResult = Result<u64, KernErr>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let all = [
            KernErr::Unspecified,
            KernErr::BadTask,
            KernErr::Inval,
            KernErr::NoMem,
            KernErr::NoFreeTask,
            KernErr::IpcNotRecv,
            KernErr::Again,
            KernErr::InvalidExe,
            KernErr::NoSys,
        ];
        for (i, a) in all.iter().enumerate() {
            assert!(a.code() < 0);
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code());
            }
        }
    }
}
