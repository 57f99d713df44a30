use std::fmt;
use std::sync::RwLock;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

/// Identity of one call handler instance.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct HandlerId(Uuid);

impl HandlerId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Debug for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandlerId({})", self.0)
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle phase of a live handler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerPhase {
    /// Armed, waiting for the transport to hand over a call.
    Listening,
    /// The process function is running.
    Processing,
    /// The terminal operation is in flight.
    Finishing,
}

#[derive(Debug)]
struct HandlerInstance {
    method: &'static str,
    queue: usize,
    phase: HandlerPhase,
    task: Option<AbortHandle>,
}

/// Every live handler instance of a server, for bulk teardown on stop.
#[derive(Debug, Default)]
pub(crate) struct HandlerRegistry {
    handlers: DashMap<HandlerId, HandlerInstance, ahash::RandomState>,
    /// Held for reading across each insert, so teardown's write lock waits out inserts in flight.
    closed: RwLock<bool>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Track a new listening instance, or `None` once the registry is torn down.
    pub(crate) fn insert(&self, method: &'static str, queue: usize) -> Option<HandlerId> {
        let closed = self.closed.read().expect("registry lock poisoned");
        if *closed {
            return None;
        }

        let id = HandlerId::generate();
        self.handlers.insert(
            id,
            HandlerInstance {
                method,
                queue,
                phase: HandlerPhase::Listening,
                task: None,
            },
        );
        Some(id)
    }

    pub(crate) fn set_phase(&self, id: &HandlerId, phase: HandlerPhase) {
        if let Some(mut instance) = self.handlers.get_mut(id) {
            instance.phase = phase;
        }
    }

    pub(crate) fn attach_task(&self, id: &HandlerId, task: AbortHandle) {
        if let Some(mut instance) = self.handlers.get_mut(id) {
            instance.task = Some(task);
        }
    }

    /// Release an instance after its terminal completion. Returns whether it was still live.
    pub(crate) fn dispose(&self, id: &HandlerId) -> bool {
        match self.handlers.remove(id) {
            Some((_, instance)) => {
                debug!(
                    handler_id = %id,
                    method = instance.method,
                    queue = instance.queue,
                    "Handler disposed"
                );
                true
            }
            None => false,
        }
    }

    /// Close the registry and drop every remaining instance, aborting running process tasks.
    pub(crate) fn teardown(&self) -> usize {
        *self.closed.write().expect("registry lock poisoned") = true;

        let ids: Vec<_> = self.handlers.iter().map(|entry| *entry.key()).collect();
        let mut removed = 0;
        for id in ids {
            if let Some((_, instance)) = self.handlers.remove(&id) {
                if let Some(task) = instance.task {
                    task.abort();
                }
                debug!(
                    handler_id = %id,
                    method = instance.method,
                    phase = ?instance.phase,
                    "Handler torn down"
                );
                removed += 1;
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn count_in(&self, phase: HandlerPhase) -> usize {
        self.handlers
            .iter()
            .filter(|entry| entry.value().phase == phase)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_dispose() {
        let registry = HandlerRegistry::new();
        let id = registry.insert("test.A/B", 0).unwrap();
        assert_eq!(registry.count_in(HandlerPhase::Listening), 1);

        registry.set_phase(&id, HandlerPhase::Processing);
        assert_eq!(registry.count_in(HandlerPhase::Processing), 1);

        assert!(registry.dispose(&id));
        assert!(!registry.dispose(&id));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_teardown_closes_registry() {
        let registry = HandlerRegistry::new();
        registry.insert("test.A/B", 0).unwrap();
        registry.insert("test.A/B", 1).unwrap();

        assert_eq!(registry.teardown(), 2);
        assert_eq!(registry.len(), 0);
        assert!(registry.insert("test.A/B", 0).is_none());
    }

    #[test]
    fn test_teardown_races_inserts() {
        let registry = std::sync::Arc::new(HandlerRegistry::new());
        let inserters: Vec<_> = (0..4)
            .map(|queue| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    while registry.insert("test.A/B", queue).is_some() {}
                })
            })
            .collect();

        while registry.len() < 16 {
            std::thread::yield_now();
        }
        registry.teardown();
        assert_eq!(registry.len(), 0);

        for inserter in inserters {
            inserter.join().unwrap();
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_teardown_aborts_tasks() {
        let registry = HandlerRegistry::new();
        let id = registry.insert("test.A/B", 0).unwrap();
        let task = tokio::spawn(std::future::pending::<()>());
        registry.attach_task(&id, task.abort_handle());

        registry.teardown();
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
