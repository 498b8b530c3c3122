//! Status word encoding, following the `system(3)` convention described in
//! `# 4.4` ("Status encoding convention") and used by both
//! [`crate::pco::Pco::status`] (decoding a real `waitpid` status) and the
//! `rsystemd` dispatcher (decoding the number a shell prints for `$?`).

/// A `system(3)`-shaped status word.
///
/// Two independent encodings feed into the same logical shape:
/// - A real wait status from `waitpid`, decoded with the standard
///   `WIFEXITED`/`WIFSIGNALED`/`WEXITSTATUS`/`WTERMSIG` macros.
/// - A shell-reported `$?` value following the convention "values with
///   the high bit of the low byte set indicate termination-by-signal
///   (`0x80 | signum`), otherwise it's a plain exit code" — the only
///   representation a POSIX shell can hand back over a pipe.
///
/// Both are normalized into the same internal representation (exit code
/// shifted into the high byte, signal flag + number in the low byte) so
/// downstream code applies one set of predicates regardless of origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(i32);

const SIGNALED_FLAG: i32 = 0x7f;

impl StatusWord {
    /// A status word for a process that exited normally with `code`.
    pub fn from_exit_code(code: i32) -> Self {
        Self((code & 0xff) << 8)
    }

    /// A status word for a process terminated by `signum`.
    pub fn from_signal(signum: i32, core_dump: bool) -> Self {
        let dump_bit = if core_dump { 0x80 } else { 0 };
        Self((signum & 0x7f) | dump_bit)
    }

    /// Decodes a real wait status as returned by `waitpid(2)`.
    pub fn from_wait_status(raw: i32) -> Self {
        Self(raw)
    }

    /// Decodes the value a shell prints for `$?` after it runs a command
    /// that was itself killed by a signal: `0x80 | signum`. A plain exit
    /// code is anything `< 128`.
    pub fn from_shell_reported(n: i32) -> Self {
        if n >= 128 {
            Self::from_signal(n - 128, false)
        } else {
            Self::from_exit_code(n)
        }
    }

    pub fn as_raw(self) -> i32 {
        self.0
    }

    pub fn is_exited(self) -> bool {
        (self.0 & SIGNALED_FLAG) == 0
    }

    /// Mirrors glibc's `WIFSIGNALED` macro bit trick.
    pub fn is_signaled(self) -> bool {
        ((self.0 & SIGNALED_FLAG) + 1) as i8 >> 1 > 0
    }

    pub fn exit_code(self) -> Option<i32> {
        self.is_exited().then_some((self.0 >> 8) & 0xff)
    }

    pub fn term_signal(self) -> Option<i32> {
        self.is_signaled().then_some(self.0 & 0x7f)
    }

    pub fn core_dumped(self) -> bool {
        self.is_signaled() && (self.0 & 0x80) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_round_trips() {
        let w = StatusWord::from_exit_code(42);
        assert!(w.is_exited());
        assert_eq!(w.exit_code(), Some(42));
        assert_eq!(w.term_signal(), None);
    }

    #[test]
    fn signal_round_trips() {
        let w = StatusWord::from_signal(9, false);
        assert!(w.is_signaled());
        assert_eq!(w.term_signal(), Some(9));
        assert_eq!(w.exit_code(), None);
    }

    #[test]
    fn shell_reported_signal_convention_decodes() {
        // A shell reports $? = 137 for "killed by SIGKILL (9)": 128 + 9.
        let w = StatusWord::from_shell_reported(137);
        assert!(w.is_signaled());
        assert_eq!(w.term_signal(), Some(9));
    }

    #[test]
    fn shell_reported_plain_exit_code_decodes() {
        let w = StatusWord::from_shell_reported(0);
        assert!(w.is_exited());
        assert_eq!(w.exit_code(), Some(0));
    }

    proptest::proptest! {
        #[test]
        fn exit_code_encode_decode_is_identity(code in 0i32..256) {
            let w = StatusWord::from_exit_code(code);
            proptest::prop_assert_eq!(w.exit_code(), Some(code & 0xff));
        }

        #[test]
        fn signal_encode_decode_is_identity(sig in 1i32..64, dump in proptest::bool::ANY) {
            let w = StatusWord::from_signal(sig, dump);
            proptest::prop_assert_eq!(w.term_signal(), Some(sig));
            proptest::prop_assert_eq!(w.core_dumped(), dump);
        }
    }
}
