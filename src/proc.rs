//! OS process probes and group termination.
//!
//! Backends are spawned into their own process group so a group kill takes
//! down whatever tree the agent CLI forked (shells, node, etc). On non-Unix
//! platforms plain per-process termination is used instead.

#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0) probes existence. EPERM still means the process exists.
    let rc = unsafe { libc::kill(pid as i32, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let mut system = sysinfo::System::new();
    system.refresh_processes(
        sysinfo::ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]),
        true,
    );
    system.process(sysinfo::Pid::from_u32(pid)).is_some()
}

/// SIGKILL the child's whole process group. `pid` is the group leader (the
/// direct child, spawned with its own group).
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {
    // The caller falls back to Child::kill on non-Unix.
}

/// SIGTERM the child's process group, giving it a chance to exit cleanly.
#[cfg(unix)]
pub fn term_group(pid: u32) {
    if pid == 0 {
        return;
    }
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn term_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!pid_alive(0));
    }

    #[test]
    fn absurd_pid_is_not_alive() {
        // PIDs near the default pid_max are vanishingly unlikely to exist.
        assert!(!pid_alive(4_000_000));
    }
}
