//! Stack teardown and the save/restore protocol.
//!
//! Suspension runs `pause` on every transport protocol; an external
//! serializer then extracts persistent state. On a freshly loaded stack,
//! `replace_config` substitutes the transient configuration (route table,
//! NIC map, filter handles), `restore` replays registered endpoint
//! callbacks outside the stack locks, waits on the loading group, and
//! resumes or restores the transport protocols.

use std::sync::{Arc, Condvar, Mutex};

use netstack_core::NicId;

use crate::proto::{RestoredEndpoint, ResumableEndpoint};
use crate::stack::Stack;

/// Counts outstanding asynchronous loading work during restore.
///
/// Endpoints that load state in the background call [`LoadGroup::add`] /
/// [`LoadGroup::done`]; [`Stack::restore`] waits for the count to drain
/// before resuming protocol workers.
pub struct LoadGroup {
    count: Mutex<usize>,
    cv: Condvar,
}

impl LoadGroup {
    pub(crate) fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cv: Condvar::new(),
        }
    }

    pub fn add(&self, n: usize) {
        *self.count.lock().unwrap() += n;
    }

    pub fn done(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0, "LoadGroup::done without matching add");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.cv.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.cv.wait(count).unwrap();
        }
    }
}

impl Stack {
    /// The barrier endpoints use to report asynchronous state loading.
    pub fn loading_group(&self) -> &LoadGroup {
        &self.core.loading
    }

    /// Record an endpoint to be restored on this stack.
    pub fn register_restored_endpoint(&self, ep: Arc<dyn RestoredEndpoint>) {
        self.core.mu.write().unwrap().restored_endpoints.push(ep);
    }

    /// Record an endpoint to be resumed after a save.
    pub fn register_resumable_endpoint(&self, ep: Arc<dyn ResumableEndpoint>) {
        self.core.mu.write().unwrap().resumable_endpoints.push(ep);
    }

    /// Mark the stack as participating in save/restore.
    pub fn enable_save_restore(&self) {
        self.core.mu.write().unwrap().save_restore_enabled = true;
    }

    #[must_use]
    pub fn is_save_restore_enabled(&self) -> bool {
        self.core.mu.read().unwrap().save_restore_enabled
    }

    /// Abort every registered transport endpoint, then close every
    /// protocol.
    ///
    /// Endpoints created or modified during this call may not get closed.
    pub fn close(&self) {
        for ep in self.registered_endpoints() {
            ep.abort();
        }
        for state in self.core.trans_protocols().values() {
            state.proto.close();
        }
        for proto in self.core.net_protocols().values() {
            proto.close();
        }
        tracing::info!("stack closed");
    }

    /// Wait for every transport endpoint and protocol to finish background
    /// work, then remove every NIC, running deferred link teardown outside
    /// the NIC lock.
    pub fn wait(&self) {
        for ep in self.registered_endpoints() {
            ep.wait();
        }
        for ep in self.cleanup_endpoints() {
            ep.wait();
        }
        for state in self.core.trans_protocols().values() {
            state.proto.wait();
        }
        for proto in self.core.net_protocols().values() {
            proto.wait();
        }

        let mut deferred = Vec::new();
        {
            let mut state = self.core.mu.write().unwrap();
            let nics: Vec<_> = state.nics.values().cloned().collect();
            for nic in nics {
                let id = nic.id();
                if let Ok(Some(act)) = self.remove_nic_locked(&mut state, id) {
                    deferred.push(act);
                }
                nic.link().wait();
            }
        }
        for act in deferred {
            act();
        }
    }

    /// `close` followed by `wait`.
    pub fn destroy(&self) {
        self.close();
        self.wait();
    }

    /// Pause protocol-level background workers ahead of serialization.
    pub fn pause(&self) {
        for state in self.core.trans_protocols().values() {
            state.proto.pause();
        }
    }

    /// Substitute this live stack's transient configuration with the one
    /// carried by `loaded`: route table, NIC map (each NIC re-parented
    /// here, its id consumed from the generator), and filter handles.
    ///
    /// The cleanup set is not transferred; use
    /// [`Stack::restore_cleanup_endpoints`] to rebuild it.
    pub fn replace_config(&self, loaded: &Stack) {
        self.set_route_table(loaded.get_route_table());

        let nics: Vec<_> = {
            let loaded_state = loaded.core.mu.read().unwrap();
            loaded_state.nics.values().cloned().collect()
        };

        {
            let mut state = self.core.mu.write().unwrap();
            state.nics.clear();
            for nic in nics {
                nic.set_stack(Arc::downgrade(&self.core));
                let id = nic.id();
                state.nics.insert(id, nic);
                // Keep the id generator ahead of every restored id.
                let _: NicId = self.next_nic_id();
            }
        }

        *self.core.iptables.write().unwrap() = loaded.iptables();
        *self.core.nftables.write().unwrap() = loaded.nftables();
        tracing::info!("stack configuration replaced from loaded stack");
    }

    /// Restart the stack after a restore. Must be called after the entire
    /// system has been restored.
    pub fn restore(&self) {
        // Restore callbacks may call back into the stack, so drop the lock
        // before running them.
        let (endpoints, save_restore_enabled) = {
            let mut state = self.core.mu.write().unwrap();
            (
                std::mem::take(&mut state.restored_endpoints),
                state.save_restore_enabled,
            )
        };
        for ep in endpoints {
            ep.restore(self);
        }

        // Let asynchronously loading endpoints settle before protocol
        // workers start.
        self.core.loading.wait();

        for state in self.core.trans_protocols().values() {
            if save_restore_enabled {
                state.proto.restore();
            } else {
                state.proto.resume();
            }
        }
        tracing::info!("stack restored");
    }

    /// Resume the stack after a save (the non-restore path).
    pub fn resume(&self) {
        let endpoints = {
            let mut state = self.core.mu.write().unwrap();
            std::mem::take(&mut state.resumable_endpoints)
        };
        for ep in endpoints {
            ep.resume();
        }
        for state in self.core.trans_protocols().values() {
            state.proto.resume();
        }
        tracing::info!("stack resumed");
    }
}
