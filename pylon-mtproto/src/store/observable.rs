use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use super::{Result, SessionStore};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    Created { key_id: u64, session_id: i64 },
    Destroyed { key_id: u64, session_id: i64 },
}

pub trait SessionObserver: Send + Sync {
    fn notify(&self, event: SessionEvent);
}

impl<F: Fn(SessionEvent) + Send + Sync> SessionObserver for F {
    fn notify(&self, event: SessionEvent) {
        self(event)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Wraps a [`SessionStore`] and tells subscribers about sessions that were
/// actually created or destroyed.
pub struct ObservableSessions {
    inner: Arc<dyn SessionStore>,
    observers: RwLock<Vec<(SubscriptionId, Arc<dyn SessionObserver>)>>,
    next_id: AtomicU64,
}

impl ObservableSessions {
    pub fn new(inner: Arc<dyn SessionStore>) -> Self {
        Self { inner, observers: RwLock::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().unwrap_or_else(PoisonError::into_inner).push((id, observer));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write().unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    fn fire(&self, event: SessionEvent) {
        let observers: Vec<_> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            observer.notify(event);
        }
    }
}

#[async_trait]
impl SessionStore for ObservableSessions {
    async fn create(&self, key_id: u64, session_id: i64) -> Result<bool> {
        let created = self.inner.create(key_id, session_id).await?;
        if created {
            self.fire(SessionEvent::Created { key_id, session_id });
        }
        Ok(created)
    }

    async fn has(&self, key_id: u64, session_id: i64) -> Result<bool> {
        self.inner.has(key_id, session_id).await
    }

    async fn destroy(&self, key_id: u64, session_id: i64) -> Result<bool> {
        let existed = self.inner.destroy(key_id, session_id).await?;
        if existed {
            self.fire(SessionEvent::Destroyed { key_id, session_id });
        }
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::store::MemorySessions;

    #[tokio::test]
    async fn events_follow_real_changes() {
        let sessions = ObservableSessions::new(Arc::new(MemorySessions::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let id = sessions.subscribe(Arc::new(move |e: SessionEvent| sink.lock().unwrap().push(e)));

        assert!(sessions.create(1, 2).await.unwrap());
        assert!(!sessions.create(1, 2).await.unwrap());
        assert!(sessions.has(1, 2).await.unwrap());
        assert!(sessions.destroy(1, 2).await.unwrap());
        assert!(!sessions.destroy(1, 2).await.unwrap());

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SessionEvent::Created { key_id: 1, session_id: 2 },
                SessionEvent::Destroyed { key_id: 1, session_id: 2 },
            ]
        );

        assert!(sessions.unsubscribe(id));
        assert!(!sessions.unsubscribe(id));
        sessions.create(3, 4).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
