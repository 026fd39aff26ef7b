//! Thread placement: core pinning and scheduling class.
//!
//! Failures are logged and ignored. An unprivileged daemon (or a test run)
//! still records correctly, only with weaker timing guarantees.

use tracing::{debug, warn};

#[cfg(target_os = "linux")]
mod imp {
    use std::io;

    pub fn pin_current_thread(core: usize) -> io::Result<()> {
        // SAFETY: `cpu_set_t` is plain data; zeroed is the empty set, and the
        // pointer passed to the kernel is valid for the call.
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn raise_realtime_priority() -> io::Result<i32> {
        // SAFETY: plain syscalls on the calling thread with a valid param.
        unsafe {
            let priority = libc::sched_get_priority_max(libc::SCHED_RR);
            if priority < 0 {
                return Err(io::Error::last_os_error());
            }
            let param = libc::sched_param {
                sched_priority: priority,
            };
            if libc::sched_setscheduler(0, libc::SCHED_RR, &param) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(priority)
        }
    }

    pub fn lower_priority() -> io::Result<i32> {
        // On Linux `setpriority(PRIO_PROCESS, 0)` applies to the calling thread.
        // SAFETY: plain syscall on the calling thread.
        unsafe {
            if libc::setpriority(libc::PRIO_PROCESS, 0, 19) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(19)
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::io;

    fn unsupported() -> io::Error {
        io::Error::new(io::ErrorKind::Unsupported, "thread scheduling control is Linux-only")
    }

    pub fn pin_current_thread(_core: usize) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn raise_realtime_priority() -> io::Result<i32> {
        Err(unsupported())
    }

    pub fn lower_priority() -> io::Result<i32> {
        Err(unsupported())
    }
}

/// Pin the calling thread to `core`, if one is configured.
pub fn pin_current_thread(role: &str, core: Option<usize>) {
    let Some(core) = core else {
        return;
    };
    match imp::pin_current_thread(core) {
        Ok(()) => debug!(role, core, "thread pinned"),
        Err(e) => warn!(role, core, error = %e, "could not pin thread"),
    }
}

/// Move the calling thread to the highest round-robin real-time priority.
pub fn raise_realtime_priority(role: &str) {
    match imp::raise_realtime_priority() {
        Ok(priority) => debug!(role, priority, "SCHED_RR priority set"),
        Err(e) => warn!(role, error = %e, "real-time priority unavailable"),
    }
}

/// Drop the calling thread to the lowest normal priority.
pub fn lower_priority(role: &str) {
    match imp::lower_priority() {
        Ok(nice) => debug!(role, nice, "thread priority lowered"),
        Err(e) => warn!(role, error = %e, "could not lower thread priority"),
    }
}
