use std::time::Duration;

const KILL_GRACE_POLLS: u32 = 20;
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Is the process still running? `kill(pid, 0)` probes without signalling;
/// EPERM means the process exists but belongs to someone else, which still
/// counts as alive.
#[must_use]
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    unsafe {
        if libc::kill(pid, 0) == 0 {
            return true;
        }
        matches!(
            std::io::Error::last_os_error().raw_os_error(),
            Some(libc::EPERM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// SIGTERM, a one-second grace period, then SIGKILL.
pub async fn terminate_pid(pid: i32) {
    if pid <= 0 {
        return;
    }
    #[cfg(unix)]
    {
        unsafe {
            let _ = libc::kill(pid, libc::SIGTERM);
        }
        for _ in 0..KILL_GRACE_POLLS {
            if !process_alive(pid) {
                return;
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }
        log::warn!("pid {pid} ignored SIGTERM; escalating to SIGKILL");
        unsafe {
            let _ = libc::kill(pid, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_sleeper() -> std::process::Child {
        std::process::Command::new("sleep")
            .arg("300")
            .spawn()
            .expect("spawn sleep")
    }

    #[test]
    fn probe_sees_live_process() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        assert!(process_alive(pid));
        let _ = child.kill();
        let _ = child.wait();
    }

    #[test]
    fn probe_rejects_nonsense_pids() {
        assert!(!process_alive(0));
        assert!(!process_alive(-1));
    }

    #[tokio::test]
    async fn terminate_kills_and_probe_confirms() {
        let mut child = spawn_sleeper();
        let pid = child.id() as i32;
        assert!(process_alive(pid));

        terminate_pid(pid).await;
        // Reap the zombie so kill(pid, 0) stops succeeding.
        let _ = child.wait();
        assert!(!process_alive(pid));
    }
}
