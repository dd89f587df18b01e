use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::{debug, warn};

/// Cooperative cancellation flag shared between the scheduler and all
/// supervised runs. Flipped once on the first failure or interrupt, never
/// reset.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Registry of solver child processes currently alive, keyed by instance
/// name. Lets the scheduler forcefully terminate everything in flight when
/// the batch is torn down.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<String, u32>>,
}

impl ChildRegistry {
    pub fn register(&self, name: &str, pid: u32) {
        self.children.lock().insert(name.to_string(), pid);
    }

    pub fn deregister(&self, name: &str) {
        self.children.lock().remove(name);
    }

    pub fn len(&self) -> usize {
        self.children.lock().len()
    }

    /// SIGKILL every registered child, a child reaped between registration
    /// and the kill is not an error
    pub fn kill_all(&self) {
        let children = std::mem::take(&mut *self.children.lock());

        for (name, pid) in children {
            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) => debug!("Killed in-flight solver for {name} (pid {pid})"),
                Err(nix::errno::Errno::ESRCH) => {
                    debug!("Solver for {name} (pid {pid}) already exited")
                }
                Err(e) => warn!("Failed to kill solver for {name} (pid {pid}): {e}"),
            }
        }
    }
}
