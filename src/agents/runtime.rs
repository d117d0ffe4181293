//! Agent runtime manager.
//!
//! One lazily-built runtime per active agent, retained in a process-wide
//! map with LRU eviction. The runtime bundles the agent's ordered
//! provider list; actions go through the shared `ActionExecutor`, which
//! holds the effectful collaborators.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::agents::providers::ContextProvider;

pub struct AgentRuntime {
    pub agent_id: i64,
    pub providers: Vec<Arc<dyn ContextProvider>>,
}

struct RuntimeEntry {
    runtime: Arc<AgentRuntime>,
    last_used: u64,
}

pub struct RuntimeManager {
    entries: Mutex<HashMap<i64, RuntimeEntry>>,
    providers: Vec<Arc<dyn ContextProvider>>,
    cap: usize,
    clock: Mutex<u64>,
}

impl RuntimeManager {
    /// `providers` is the ordered template every runtime shares; the
    /// registry is fixed at construction (no hot-loading).
    pub fn new(providers: Vec<Arc<dyn ContextProvider>>, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            providers,
            cap: cap.max(1),
            clock: Mutex::new(0),
        })
    }

    fn tick_clock(&self) -> u64 {
        let mut clock = self.clock.lock();
        *clock += 1;
        *clock
    }

    pub fn get_or_create(&self, agent_id: i64) -> Arc<AgentRuntime> {
        let now = self.tick_clock();
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&agent_id) {
            entry.last_used = now;
            return entry.runtime.clone();
        }

        if entries.len() >= self.cap {
            // Evict the least recently used runtime.
            if let Some((&victim, _)) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
            {
                entries.remove(&victim);
                debug!(agent_id = victim, "evicted agent runtime (lru)");
            }
        }

        let runtime = Arc::new(AgentRuntime {
            agent_id,
            providers: self.providers.clone(),
        });
        entries.insert(
            agent_id,
            RuntimeEntry {
                runtime: runtime.clone(),
                last_used: now,
            },
        );
        debug!(agent_id, "constructed agent runtime");
        runtime
    }

    pub fn clear_runtime(&self, agent_id: i64) -> bool {
        self.entries.lock().remove(&agent_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
