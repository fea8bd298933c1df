//! Session to worker bindings

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Where a session's calls are routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub worker_id: String,
    pub bound_at: Instant,
    pub last_used_at: Instant,
    /// A call for this session holds its worker right now
    pub in_use: bool,
}

/// `session_id -> binding`, owned by the coordinator.
///
/// Bindings expire `ttl` after their last use ended. A binding whose call is
/// still running never expires. Expiry is applied lazily on lookup and by
/// [`sweep`](Self::sweep).
#[derive(Debug)]
pub struct SessionAffinityTable {
    bindings: HashMap<String, SessionBinding>,
    ttl: Duration,
}

impl SessionAffinityTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            bindings: HashMap::new(),
            ttl,
        }
    }

    /// Live binding for `session_id`, evicting it first if it expired
    pub fn lookup(&mut self, session_id: &str, now: Instant) -> Option<&SessionBinding> {
        if self
            .bindings
            .get(session_id)
            .is_some_and(|binding| self.is_expired(binding, now))
        {
            self.bindings.remove(session_id);
            return None;
        }
        self.bindings.get(session_id)
    }

    /// Bound worker id without evicting anything
    pub fn bound_worker(&self, session_id: &str, now: Instant) -> Option<&str> {
        self.bindings
            .get(session_id)
            .filter(|binding| !self.is_expired(binding, now))
            .map(|binding| binding.worker_id.as_str())
    }

    pub fn bind(&mut self, session_id: &str, worker_id: &str, now: Instant) {
        self.bindings.insert(
            session_id.to_string(),
            SessionBinding {
                worker_id: worker_id.to_string(),
                bound_at: now,
                last_used_at: now,
                in_use: false,
            },
        );
    }

    /// A call for `session_id` got its worker. The binding is pinned until
    /// [`end_use`](Self::end_use).
    pub fn begin_use(&mut self, session_id: &str, now: Instant) {
        if let Some(binding) = self.bindings.get_mut(session_id) {
            binding.last_used_at = now;
            binding.in_use = true;
        }
    }

    /// The call returned its worker; the idle clock starts now
    pub fn end_use(&mut self, session_id: &str, now: Instant) {
        if let Some(binding) = self.bindings.get_mut(session_id) {
            binding.last_used_at = now;
            binding.in_use = false;
        }
    }

    pub fn remove(&mut self, session_id: &str) -> Option<SessionBinding> {
        self.bindings.remove(session_id)
    }

    /// Sessions currently bound to `worker_id`
    pub fn sessions_for(&self, worker_id: &str) -> Vec<String> {
        self.bindings
            .iter()
            .filter(|(_, binding)| binding.worker_id == worker_id)
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    /// Drop every expired binding; returns how many were dropped
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.bindings.len();
        let ttl = self.ttl;
        self.bindings.retain(|_, binding| {
            binding.in_use || now.saturating_duration_since(binding.last_used_at) < ttl
        });
        before - self.bindings.len()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    fn is_expired(&self, binding: &SessionBinding, now: Instant) -> bool {
        !binding.in_use && now.saturating_duration_since(binding.last_used_at) >= self.ttl
    }
}
