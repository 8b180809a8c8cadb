use packet_domain::ProcessProbe;

/// 基于操作系统信号的进程探测
#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcessProbe;

impl OsProcessProbe {
    pub fn new() -> Self {
        Self
    }
}

impl ProcessProbe for OsProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            unix_impl::is_alive(pid)
        }

        #[cfg(not(unix))]
        {
            tracing::warn!(pid, "process liveness checks are not supported on this OS");
            false
        }
    }

    fn terminate(&self, pid: u32) -> bool {
        #[cfg(unix)]
        {
            unix_impl::terminate(pid)
        }

        #[cfg(not(unix))]
        {
            tracing::warn!(pid, "process termination is not supported on this OS");
            false
        }
    }
}

#[cfg(unix)]
mod unix_impl {
    use std::io;

    use tracing::debug;

    fn to_pid(pid: u32) -> Option<libc::pid_t> {
        libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
    }

    pub(super) fn is_alive(pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        // SAFETY: signal 0 only performs the permission and existence check.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM: 进程存在，但属于其他用户
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    pub(super) fn terminate(pid: u32) -> bool {
        let Some(raw) = to_pid(pid) else {
            return false;
        };
        // SAFETY: plain kill(2) on a positive pid, never a process group.
        let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
        if rc != 0 {
            debug!(pid, error = %io::Error::last_os_error(), "kill failed");
        }
        rc == 0
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let probe = OsProcessProbe::new();
        assert!(probe.is_alive(std::process::id()));
        assert!(!probe.is_alive(0));
    }

    #[test]
    fn test_terminate_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let probe = OsProcessProbe::new();
        let pid = child.id();
        assert!(probe.is_alive(pid));
        assert!(probe.terminate(pid));
        child.wait().unwrap();
        assert!(!probe.is_alive(pid));
    }

    #[test]
    fn test_out_of_range_pid() {
        let probe = OsProcessProbe::new();
        assert!(!probe.is_alive(u32::MAX));
        assert!(!probe.terminate(u32::MAX));
    }
}
