//! Process registry: which thread owns which live children.
//!
//! Every pipeline registers the children it starts under the launching
//! thread's [`OwnerHandle`]. `manage()` forgets a pid as soon as it reaps it,
//! so the registry only ever holds processes that may still be running.
//!
//! An interrupt handler can then signal everything a given thread started
//! ([`ProcessRegistry::kill_for_thread`]) or everything at all
//! ([`ProcessRegistry::kill_all`]). Both only send signals; reaping stays
//! with the driver loop that owns the child, which sees the exit on its
//! next pass.
//!
//! [`ProcessRegistry::shutdown`] is the fatal variant: it signals every
//! registered child and refuses further launches with
//! [`Error::NoMoreProcesses`].

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::ThreadId;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::error::{Error, Result};

/// Identifies the thread that registered a set of children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(ThreadId);

impl OwnerHandle {
    /// Handle for the calling thread.
    pub fn current() -> Self {
        Self(std::thread::current().id())
    }
}

#[derive(Debug, Default)]
struct Inner {
    live: HashMap<OwnerHandle, BTreeSet<Pid>>,
    shut_down: bool,
}

/// Shared table of live children, keyed by owning thread.
///
/// Cloning is cheap and every clone sees the same table. Use
/// [`ProcessRegistry::global`] unless a caller needs an isolated one.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<Inner>>,
}

static GLOBAL: OnceLock<ProcessRegistry> = OnceLock::new();

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ProcessRegistry {
        GLOBAL.get_or_init(ProcessRegistry::new)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail with [`Error::NoMoreProcesses`] once [`shutdown`](Self::shutdown) ran.
    pub fn check_open(&self) -> Result<()> {
        if self.lock().shut_down {
            Err(Error::NoMoreProcesses)
        } else {
            Ok(())
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.lock().shut_down
    }

    /// Record `pid` as a live child of the calling thread.
    ///
    /// After a shutdown the child is killed on the spot and
    /// [`Error::NoMoreProcesses`] is returned; the caller still has to reap it.
    pub fn register(&self, pid: Pid) -> Result<OwnerHandle> {
        let owner = OwnerHandle::current();
        let mut inner = self.lock();
        if inner.shut_down {
            drop(inner);
            send(pid, Signal::SIGKILL);
            return Err(Error::NoMoreProcesses);
        }
        inner.live.entry(owner).or_default().insert(pid);
        tracing::trace!(pid = pid.as_raw(), ?owner, "registered");
        Ok(owner)
    }

    /// Drop `pid` from the table, whichever thread owns it.
    pub fn forget(&self, pid: Pid) {
        let mut inner = self.lock();
        inner.live.retain(|_, pids| {
            pids.remove(&pid);
            !pids.is_empty()
        });
    }

    /// Live children registered by `owner`, in pid order.
    pub fn live_for(&self, owner: OwnerHandle) -> Vec<Pid> {
        self.lock()
            .live
            .get(&owner)
            .map(|pids| pids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of live children across all threads.
    pub fn live_count(&self) -> usize {
        self.lock().live.values().map(BTreeSet::len).sum()
    }

    /// Signal every live child registered by `owner`. Returns how many were signalled.
    pub fn kill_for_thread(&self, owner: OwnerHandle, signal: Signal) -> usize {
        let pids = self.live_for(owner);
        pids.into_iter().filter(|pid| send(*pid, signal)).count()
    }

    /// Signal every registered child. Returns how many were signalled.
    pub fn kill_all(&self, signal: Signal) -> usize {
        let pids: Vec<Pid> = self.lock().live.values().flatten().copied().collect();
        pids.into_iter().filter(|pid| send(*pid, signal)).count()
    }

    /// Terminate everything and refuse further launches.
    pub fn shutdown(&self) -> usize {
        let pids: Vec<Pid> = {
            let mut inner = self.lock();
            inner.shut_down = true;
            inner.live.values().flatten().copied().collect()
        };
        let signalled = pids
            .into_iter()
            .filter(|pid| send(*pid, Signal::SIGTERM))
            .count();
        tracing::debug!(signalled, "process registry shut down");
        signalled
    }
}

/// Send `signal`, tolerating a child that already exited.
fn send(pid: Pid, signal: Signal) -> bool {
    match kill(pid, signal) {
        Ok(()) => {
            tracing::debug!(pid = pid.as_raw(), %signal, "signalled");
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            tracing::warn!(pid = pid.as_raw(), %signal, error = %e, "kill failed");
            false
        }
    }
}

/// Send SIGTERM to every child in the process-wide registry.
pub fn kill_all() -> usize {
    ProcessRegistry::global().kill_all(Signal::SIGTERM)
}

/// Send SIGTERM to every child `owner` registered in the process-wide registry.
pub fn kill_for_thread(owner: OwnerHandle) -> usize {
    ProcessRegistry::global().kill_for_thread(owner, Signal::SIGTERM)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_forget() {
        let registry = ProcessRegistry::new();
        let owner = registry.register(Pid::from_raw(999_991)).unwrap();
        registry.register(Pid::from_raw(999_990)).unwrap();
        assert_eq!(owner, OwnerHandle::current());
        assert_eq!(
            registry.live_for(owner),
            [Pid::from_raw(999_990), Pid::from_raw(999_991)]
        );

        registry.forget(Pid::from_raw(999_991));
        registry.forget(Pid::from_raw(999_990));
        assert_eq!(registry.live_count(), 0);
        assert!(registry.live_for(owner).is_empty());
    }

    #[test]
    fn owners_are_per_thread() {
        let registry = ProcessRegistry::new();
        let other = {
            let registry = registry.clone();
            std::thread::spawn(move || registry.register(Pid::from_raw(999_989)).unwrap())
                .join()
                .unwrap()
        };
        assert_ne!(other, OwnerHandle::current());
        assert!(registry.live_for(OwnerHandle::current()).is_empty());
        assert_eq!(registry.live_for(other), [Pid::from_raw(999_989)]);
        registry.forget(Pid::from_raw(999_989));
    }

    #[test]
    fn shutdown_refuses_new_work() {
        let registry = ProcessRegistry::new();
        assert!(registry.check_open().is_ok());
        assert_eq!(registry.shutdown(), 0);
        assert!(registry.is_shut_down());
        assert!(matches!(registry.check_open(), Err(Error::NoMoreProcesses)));
    }
}
