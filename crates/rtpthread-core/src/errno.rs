//! Error number definitions.
//!
//! The subset of `<errno.h>` the threading layer reports through
//! [`Error::errno`](crate::Error::errno).

/// Well-known errno constants.
pub const EPERM: i32 = 1;
pub const ESRCH: i32 = 3;
pub const ENOMEM: i32 = 12;
pub const EBUSY: i32 = 16;
pub const EINVAL: i32 = 22;
pub const EDEADLK: i32 = 35;
pub const ETIMEDOUT: i32 = 110;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_values_match_linux() {
        assert_eq!(EPERM, 1);
        assert_eq!(EBUSY, 16);
        assert_eq!(EINVAL, 22);
        assert_eq!(ETIMEDOUT, 110);
    }
}
