//! The process-wide PCO registry (`# 3`, `# 4.3`, `# 5`).
//!
//! A doubly linked list in the original C; here a plain `HashMap` keyed by
//! pid under one mutex, paralleling the teacher's single `DashMap<u32,
//! PtySession>` table in `core/process_manager.rs::Inner`. Unlike that
//! table, this one holds `Weak` references only — "the registry does not
//! own lifetimes" (`# 3`) — so a [`crate::Pco`] going out of scope doesn't
//! need to explicitly unregister to avoid leaking memory, though `delete`
//! still unlinks eagerly for a prompt pid reuse story.

use std::collections::HashMap;
use std::sync::{Mutex, Weak};

use once_cell::sync::Lazy;

use crate::pco::PcoShared;

static REGISTRY: Lazy<Mutex<HashMap<libc::pid_t, Weak<PcoShared>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a live PCO under its pid. Called once, right after `fork`
/// succeeds and the pid is known (`# 4.2`'s `exec`).
pub(crate) fn register(pid: libc::pid_t, shared: &std::sync::Arc<PcoShared>) {
    let mut reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.insert(pid, std::sync::Arc::downgrade(shared));
}

/// Removes a pid from the registry — `# 8`'s invariant "After `delete`,
/// the handle's pid is released (no subsequent reaper event references
/// it)" depends on this happening before the pid can be reused by the OS.
pub(crate) fn unregister(pid: libc::pid_t) {
    let mut reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.remove(&pid);
}

/// Looks a dying child up by pid. Called by the reaper with `SIGCHLD`
/// masked in the calling thread to avoid the signal-taking-the-mutex
/// deadlock `# 4.3`/`# 9` describe — in this port that mask is implicit:
/// the consumer thread `signal-hook` drives is an ordinary thread, never
/// the actual signal handler, so it is always safe for it to block on
/// this mutex (see `reaper.rs`).
pub(crate) fn lookup(pid: libc::pid_t) -> Option<std::sync::Arc<PcoShared>> {
    let reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.get(&pid).and_then(Weak::upgrade)
}

/// Clears the registry without touching any file descriptor or sending
/// any signal — used by the post-fork child hook (`# 4.3`, `# 9`): a
/// forked child did not fork the controlled processes, so it must not
/// reap or kill them, it must simply forget about them.
pub(crate) fn clear_for_forked_child() {
    let mut reg = REGISTRY.lock().expect("registry mutex poisoned");
    reg.clear();
}

#[cfg(test)]
pub(crate) fn len() -> usize {
    REGISTRY.lock().expect("registry mutex poisoned").len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pco::{PcoShared, State};
    use std::sync::Arc;

    #[test]
    fn registry_has_no_duplicate_pids() {
        // Two distinct PCOs registering under the same pid: the second
        // insert simply replaces the first weak ref, so at no point can
        // `lookup` resolve to two different objects for one pid.
        let a = Arc::new(PcoShared::new_for_test(State::Init));
        let b = Arc::new(PcoShared::new_for_test(State::Init));
        register(99999, &a);
        register(99999, &b);
        assert_eq!(len_of_pid(99999), 1);
        unregister(99999);
    }

    fn len_of_pid(pid: libc::pid_t) -> usize {
        let reg = REGISTRY.lock().unwrap();
        usize::from(reg.contains_key(&pid))
    }
}
