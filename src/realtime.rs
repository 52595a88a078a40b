//! Real-time thread scheduling helpers shared by the sync engine and beat
//! oracle worker threads.

use anyhow::{anyhow, Result};
use log::warn;

/// Requests SCHED_FIFO scheduling for the calling thread on Linux. Best
/// effort: a failure (typically missing privilege) is reported but does
/// not stop the caller from proceeding at normal priority.
pub fn set_realtime_priority() -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        use libc::{sched_param, sched_setscheduler, SCHED_FIFO};
        let param = sched_param { sched_priority: 80 };
        let result = unsafe { sched_setscheduler(0, SCHED_FIFO, &param) };
        if result != 0 {
            return Err(anyhow!(
                "failed to set SCHED_FIFO real-time priority: {}",
                std::io::Error::last_os_error()
            ));
        }
    }

    #[cfg(target_os = "macos")]
    {
        warn!("real-time priority setting not implemented for macOS");
    }

    #[cfg(target_os = "windows")]
    {
        warn!("real-time priority setting not implemented for Windows");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_realtime_priority_does_not_panic() {
        let _ = set_realtime_priority();
    }
}
