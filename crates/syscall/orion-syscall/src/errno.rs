//! The errno namespace.
//!
//! POSIX errno values in `[1, 84]` plus [`Errno::EFAILED`] as a general
//! failure code. Values are stable ABI; syscalls return them negated.

/// A kernel error code as seen across the syscall boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
#[allow(missing_docs, reason = "names follow POSIX; the table is the doc")]
pub enum Errno {
    E2BIG = 1,
    EACCES = 2,
    EADDRINUSE = 3,
    EADDRNOTAVAIL = 4,
    EAFNOSUPPORT = 5,
    EAGAIN = 6,
    EALREADY = 7,
    EBADF = 8,
    EBADMSG = 9,
    EBUSY = 10,
    ECANCELED = 11,
    ECHILD = 12,
    ECONNABORTED = 13,
    ECONNREFUSED = 14,
    ECONNRESET = 15,
    EDEADLK = 16,
    EDESTADDRREQ = 17,
    EDOM = 18,
    EDQUOT = 19,
    EEXIST = 20,
    EFAULT = 21,
    EFBIG = 22,
    EHOSTUNREACH = 23,
    EIDRM = 24,
    EILSEQ = 25,
    EINPROGRESS = 26,
    EINTR = 27,
    EINVAL = 28,
    EIO = 29,
    EISCONN = 30,
    EISDIR = 31,
    ELOOP = 32,
    EMFILE = 33,
    EMLINK = 34,
    EMSGSIZE = 35,
    EMULTIHOP = 36,
    ENAMETOOLONG = 37,
    ENETDOWN = 38,
    ENETRESET = 39,
    ENETUNREACH = 40,
    ENFILE = 41,
    ENOBUFS = 42,
    ENODATA = 43,
    ENODEV = 44,
    ENOENT = 45,
    ENOEXEC = 46,
    ENOLCK = 47,
    ENOLINK = 48,
    ENOMEM = 49,
    ENOMSG = 50,
    ENOPROTOOPT = 51,
    ENOSPC = 52,
    ENOSR = 53,
    ENOSTR = 54,
    ENOSYS = 55,
    ENOTBLK = 56,
    ENOTCONN = 57,
    ENOTDIR = 58,
    ENOTEMPTY = 59,
    ENOTMNT = 60,
    ENOTRECOVERABLE = 61,
    ENOTSOCK = 62,
    ENOTSUP = 63,
    ENOTTY = 64,
    ENXIO = 65,
    EOPNOTSUPP = 66,
    EOVERFLOW = 67,
    EOWNERDEAD = 68,
    EPERM = 69,
    EPIPE = 70,
    EPROTO = 71,
    EPROTONOSUPPORT = 72,
    EPROTOTYPE = 73,
    ERANGE = 74,
    EROFS = 75,
    ESPIPE = 76,
    ESRCH = 77,
    ESTALE = 78,
    ETIME = 79,
    ETIMEDOUT = 80,
    ETXTBSY = 81,
    EWOULDBLOCK = 82,
    EXDEV = 83,
    /// General failure — the catch-all for internal errors with no better code.
    EFAILED = 84,
}

/// The highest valid errno value.
pub const ERRNO_MAX: i32 = 84;

impl Errno {
    /// Returns the raw positive errno value.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Returns the negated value a syscall places in RAX on failure.
    #[must_use]
    pub const fn as_neg(self) -> isize {
        -(self as i32 as isize)
    }

    /// Converts a raw positive errno value back into an `Errno`.
    ///
    /// Out-of-range values map to [`Errno::EFAILED`], keeping drivers from
    /// leaking ad-hoc codes outside the errno namespace.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        if raw >= 1 && raw <= ERRNO_MAX {
            // SAFETY: Errno is repr(i32) with contiguous discriminants 1..=84,
            // and `raw` was just range-checked.
            unsafe { core::mem::transmute::<i32, Errno>(raw) }
        } else {
            Errno::EFAILED
        }
    }

    /// Returns the symbolic name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::E2BIG => "E2BIG",
            Self::EACCES => "EACCES",
            Self::EADDRINUSE => "EADDRINUSE",
            Self::EADDRNOTAVAIL => "EADDRNOTAVAIL",
            Self::EAFNOSUPPORT => "EAFNOSUPPORT",
            Self::EAGAIN => "EAGAIN",
            Self::EALREADY => "EALREADY",
            Self::EBADF => "EBADF",
            Self::EBADMSG => "EBADMSG",
            Self::EBUSY => "EBUSY",
            Self::ECANCELED => "ECANCELED",
            Self::ECHILD => "ECHILD",
            Self::ECONNABORTED => "ECONNABORTED",
            Self::ECONNREFUSED => "ECONNREFUSED",
            Self::ECONNRESET => "ECONNRESET",
            Self::EDEADLK => "EDEADLK",
            Self::EDESTADDRREQ => "EDESTADDRREQ",
            Self::EDOM => "EDOM",
            Self::EDQUOT => "EDQUOT",
            Self::EEXIST => "EEXIST",
            Self::EFAULT => "EFAULT",
            Self::EFBIG => "EFBIG",
            Self::EHOSTUNREACH => "EHOSTUNREACH",
            Self::EIDRM => "EIDRM",
            Self::EILSEQ => "EILSEQ",
            Self::EINPROGRESS => "EINPROGRESS",
            Self::EINTR => "EINTR",
            Self::EINVAL => "EINVAL",
            Self::EIO => "EIO",
            Self::EISCONN => "EISCONN",
            Self::EISDIR => "EISDIR",
            Self::ELOOP => "ELOOP",
            Self::EMFILE => "EMFILE",
            Self::EMLINK => "EMLINK",
            Self::EMSGSIZE => "EMSGSIZE",
            Self::EMULTIHOP => "EMULTIHOP",
            Self::ENAMETOOLONG => "ENAMETOOLONG",
            Self::ENETDOWN => "ENETDOWN",
            Self::ENETRESET => "ENETRESET",
            Self::ENETUNREACH => "ENETUNREACH",
            Self::ENFILE => "ENFILE",
            Self::ENOBUFS => "ENOBUFS",
            Self::ENODATA => "ENODATA",
            Self::ENODEV => "ENODEV",
            Self::ENOENT => "ENOENT",
            Self::ENOEXEC => "ENOEXEC",
            Self::ENOLCK => "ENOLCK",
            Self::ENOLINK => "ENOLINK",
            Self::ENOMEM => "ENOMEM",
            Self::ENOMSG => "ENOMSG",
            Self::ENOPROTOOPT => "ENOPROTOOPT",
            Self::ENOSPC => "ENOSPC",
            Self::ENOSR => "ENOSR",
            Self::ENOSTR => "ENOSTR",
            Self::ENOSYS => "ENOSYS",
            Self::ENOTBLK => "ENOTBLK",
            Self::ENOTCONN => "ENOTCONN",
            Self::ENOTDIR => "ENOTDIR",
            Self::ENOTEMPTY => "ENOTEMPTY",
            Self::ENOTMNT => "ENOTMNT",
            Self::ENOTRECOVERABLE => "ENOTRECOVERABLE",
            Self::ENOTSOCK => "ENOTSOCK",
            Self::ENOTSUP => "ENOTSUP",
            Self::ENOTTY => "ENOTTY",
            Self::ENXIO => "ENXIO",
            Self::EOPNOTSUPP => "EOPNOTSUPP",
            Self::EOVERFLOW => "EOVERFLOW",
            Self::EOWNERDEAD => "EOWNERDEAD",
            Self::EPERM => "EPERM",
            Self::EPIPE => "EPIPE",
            Self::EPROTO => "EPROTO",
            Self::EPROTONOSUPPORT => "EPROTONOSUPPORT",
            Self::EPROTOTYPE => "EPROTOTYPE",
            Self::ERANGE => "ERANGE",
            Self::EROFS => "EROFS",
            Self::ESPIPE => "ESPIPE",
            Self::ESRCH => "ESRCH",
            Self::ESTALE => "ESTALE",
            Self::ETIME => "ETIME",
            Self::ETIMEDOUT => "ETIMEDOUT",
            Self::ETXTBSY => "ETXTBSY",
            Self::EWOULDBLOCK => "EWOULDBLOCK",
            Self::EXDEV => "EXDEV",
            Self::EFAILED => "EFAILED",
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shorthand for `Result<T, Errno>`, used by every syscall-adjacent path.
pub type Result<T> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_values() {
        for raw in 1..=ERRNO_MAX {
            let e = Errno::from_raw(raw);
            assert_eq!(e.as_i32(), raw);
        }
    }

    #[test]
    fn out_of_range_maps_to_efailed() {
        assert_eq!(Errno::from_raw(0), Errno::EFAILED);
        assert_eq!(Errno::from_raw(85), Errno::EFAILED);
        assert_eq!(Errno::from_raw(-3), Errno::EFAILED);
    }

    #[test]
    fn negated_return_value() {
        assert_eq!(Errno::ENOENT.as_neg(), -45);
        assert_eq!(Errno::EFAILED.as_neg(), -84);
    }
}
