use nix::{
    sys::signal::{self, Signal},
    unistd::Pid,
};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks whether a process with the given PID exists.
///
/// Sends signal 0, which performs the permission and existence checks without delivering a signal.
pub fn is_process_running(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // The process exists but belongs to someone else.
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Sends a signal to a process, logging instead of failing when it is already gone.
pub fn send_signal(pid: u32, sig: Signal) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid, signal = ?sig, error = %e, "failed to signal process");
            false
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn test_unused_pid_is_not_running() {
        // Linux caps pids at 2^22.
        assert!(!is_process_running(4_194_304 + 17));
    }
}
