//! The event bus: progress and outcome notifications for presentation
//! collaborators.
//!
//! Synchronous subscribers run serially in publish order on the
//! publisher's task. Asynchronous subscribers run concurrently on spawned
//! tasks; their failures are logged and never reach the publisher.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use synclone_state::StateProgress;

use crate::error::UserError;

/// Events published by the scheduler and session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    /// A repository finished cloning or updating.
    RepositoryCloned {
        session_id: String,
        repository: String,
        url: String,
        operation: String,
        duration_ms: u64,
        finished_at: DateTime<Utc>,
    },
    /// A scheduled task reached a terminal outcome (success or exhausted).
    TaskCompleted {
        session_id: String,
        repository: String,
        success: bool,
        progress: StateProgress,
    },
    /// A classified error surfaced past local recovery.
    ErrorOccurred {
        session_id: String,
        repository: Option<String>,
        error: UserError,
    },
}

impl Event {
    /// The dotted event name used for subscription filtering and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RepositoryCloned { .. } => "repository.cloned",
            Self::TaskCompleted { .. } => "task.completed",
            Self::ErrorOccurred { .. } => "error.occurred",
        }
    }
}

/// A synchronous subscriber: runs inline, in publish order.
pub type SyncSubscriber = Arc<dyn Fn(&Event) + Send + Sync>;

/// An asynchronous subscriber: runs on its own task per event.
#[async_trait]
pub trait AsyncSubscriber: Send + Sync {
    fn name(&self) -> &str;
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

/// Single-producer-per-event, multi-subscriber bus.
#[derive(Default)]
pub struct EventBus {
    sync_subscribers: RwLock<Vec<SyncSubscriber>>,
    async_subscribers: RwLock<Vec<Arc<dyn AsyncSubscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: SyncSubscriber) {
        self.sync_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    pub fn subscribe_async(&self, subscriber: Arc<dyn AsyncSubscriber>) {
        self.async_subscribers
            .write()
            .expect("subscriber lock poisoned")
            .push(subscriber);
    }

    /// Publish an event to every subscriber.
    ///
    /// Synchronous handlers run here, serially; asynchronous handlers are
    /// spawned and their errors logged without affecting the producer.
    pub fn publish(&self, event: Event) {
        tracing::debug!(event = event.kind(), "publishing event");

        let sync_subscribers = self
            .sync_subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();
        for subscriber in &sync_subscribers {
            subscriber(&event);
        }

        let async_subscribers = self
            .async_subscribers
            .read()
            .expect("subscriber lock poisoned")
            .clone();
        for subscriber in async_subscribers {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(e) = subscriber.handle(event).await {
                    tracing::warn!(
                        subscriber = subscriber.name(),
                        error = %e,
                        "async event subscriber failed"
                    );
                }
            });
        }
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field(
                "sync_subscribers",
                &self
                    .sync_subscribers
                    .read()
                    .expect("subscriber lock poisoned")
                    .len(),
            )
            .field(
                "async_subscribers",
                &self
                    .async_subscribers
                    .read()
                    .expect("subscriber lock poisoned")
                    .len(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ErrorDomain};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cloned_event(repo: &str) -> Event {
        Event::RepositoryCloned {
            session_id: "github:acme".into(),
            repository: repo.into(),
            url: format!("https://github.com/acme/{repo}.git"),
            operation: "clone".into(),
            duration_ms: 1200,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn kind_names_are_dotted() {
        assert_eq!(cloned_event("r1").kind(), "repository.cloned");
        let err_event = Event::ErrorOccurred {
            session_id: "github:acme".into(),
            repository: None,
            error: UserError::new(
                ErrorDomain::Network,
                ErrorCategory::Timeout,
                "request_timeout",
                "timed out",
            ),
        };
        assert_eq!(err_event.kind(), "error.occurred");
    }

    #[tokio::test]
    async fn sync_subscribers_run_serially_in_publish_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let log = log.clone();
            bus.subscribe(Arc::new(move |event: &Event| {
                if let Event::RepositoryCloned { repository, .. } = event {
                    log.lock().unwrap().push(format!("{tag}:{repository}"));
                }
            }));
        }

        bus.publish(cloned_event("r1"));
        bus.publish(cloned_event("r2"));

        let seen = log.lock().unwrap().clone();
        assert_eq!(seen, vec!["first:r1", "second:r1", "first:r2", "second:r2"]);
    }

    #[tokio::test]
    async fn async_subscriber_errors_do_not_reach_publisher() {
        struct Failing(AtomicUsize);

        #[async_trait]
        impl AsyncSubscriber for Failing {
            fn name(&self) -> &str {
                "failing"
            }
            async fn handle(&self, _event: Event) -> anyhow::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("subscriber exploded")
            }
        }

        let bus = EventBus::new();
        let subscriber = Arc::new(Failing(AtomicUsize::new(0)));
        bus.subscribe_async(subscriber.clone());

        // publish does not panic or error.
        bus.publish(cloned_event("r1"));

        // Give the spawned handler a moment to run.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(subscriber.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn event_serializes_with_kind_tag() {
        let json = serde_json::to_value(cloned_event("r1")).unwrap();
        assert_eq!(json["kind"], "repository_cloned");
        assert_eq!(json["repository"], "r1");
    }
}
