//! Pinned egress worker threads
//!
//! Each transmit core gets one OS thread running an [`EgressLoop`] for its
//! whole life. Pinning happens before the loop starts, and a pinning
//! failure is reported back to the launcher as a launch failure.

use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, info};

use crate::egress::EgressLoop;
use crate::error::BridgeError;
use crate::shutdown::ShutdownToken;

/// Handle to a running egress worker
pub struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    pub core: usize,
    pub port_id: u16,
}

impl WorkerHandle {
    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        if let Some(handle) = self.thread.take() {
            handle
                .join()
                .map_err(|_| "Worker thread panicked".to_string())
        } else {
            Ok(())
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// Launch `worker` on its own thread, pinned to `core` if `pin` is set
pub fn spawn_worker(
    core: usize,
    pin: bool,
    worker: EgressLoop,
    shutdown: ShutdownToken,
) -> Result<WorkerHandle, BridgeError> {
    let port_id = worker.port_id();
    let (ready_tx, ready_rx) = mpsc::channel();

    let thread = thread::Builder::new()
        .name(format!("kni-tx-{core}"))
        .spawn(move || {
            let pinned = if pin { pin_to_core(core) } else { Ok(()) };
            let ok = pinned.is_ok();
            let _ = ready_tx.send(pinned);
            if ok {
                worker.run(&shutdown);
            }
        })
        .map_err(|source| BridgeError::WorkerLaunch { core, source })?;

    let launched = ready_rx
        .recv()
        .unwrap_or_else(|_| Err(io::Error::other("worker exited before starting")));
    if let Err(source) = launched {
        let _ = thread.join();
        return Err(BridgeError::WorkerLaunch { core, source });
    }

    info!(core, port_id, pinned = pin, "Egress worker launched");
    Ok(WorkerHandle {
        thread: Some(thread),
        core,
        port_id,
    })
}

/// Pin the calling thread to a single core
pub fn pin_to_core(core: usize) -> io::Result<()> {
    let mut set = CpuSet::new();
    set.set(core).map_err(io::Error::from)?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(io::Error::from)?;
    debug!(core, "Thread pinned");
    Ok(())
}

/// NUMA node a core belongs to, from sysfs
pub fn numa_node_of_core(core: usize) -> Option<u32> {
    std::fs::read_dir(format!("/sys/devices/system/cpu/cpu{core}"))
        .ok()?
        .filter_map(Result::ok)
        .find_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix("node")?
                .parse()
                .ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_core_has_no_numa_node() {
        assert_eq!(numa_node_of_core(usize::MAX / 2), None);
    }

    #[test]
    fn test_pin_rejects_impossible_core() {
        assert!(pin_to_core(1 << 20).is_err());
    }
}
