//! Best-effort process probes and signals for registered sessions.

/// Null-signal existence check. EPERM means the process exists but belongs
/// to someone else, which still counts as alive.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        true
    } else {
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    // No reliable probe; heartbeats carry liveness on this platform.
    true
}

/// Ask a session's process to terminate. Non-blocking, best-effort.
#[cfg(unix)]
pub fn terminate(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
}

#[cfg(not(unix))]
pub fn terminate(_pid: u32) -> bool {
    false
}

/// Resident set size of a process, via the OS `ps` tool. `None` when the
/// probe fails for any reason.
pub async fn resident_memory_bytes(pid: u32) -> Option<u64> {
    let output = tokio::process::Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let kb: u64 = String::from_utf8_lossy(&output.stdout).trim().parse().ok()?;
    Some(kb * 1024)
}
