//! Event bus: named events fanned out to subscribers in subscription order.
//!
//! Delivery runs on the publisher's context, one subscriber after another.
//! A failing handler is logged, audited and charged to its module's health;
//! delivery continues and nothing propagates back to the publisher.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::commbus::owner::{drain_all, CallBudget, CallGate, CallOutcome, OwnerRef};
use crate::kernel::audit::{AuditKind, AuditLog, AuditScope};
use crate::types::{Error, ModuleId, Result, SubscriptionId, TaskId, TimeoutConfig};

/// Event message delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub timestamp_ms: i64,
    /// Publishing module name, or "host".
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            payload,
            timestamp_ms: Utc::now().timestamp_millis(),
            source: source.into(),
            task_id: None,
        }
    }

    pub fn with_task(mut self, task_id: Option<TaskId>) -> Self {
        self.task_id = task_id;
        self
    }
}

/// Handler invoked for each delivered event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<()>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self)(event.clone()).await
    }
}

#[derive(Clone)]
struct SubscriptionEntry {
    id: SubscriptionId,
    owner: OwnerRef,
    handler: Arc<dyn EventHandler>,
    gate: CallGate,
}

/// One failed delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryFailure {
    pub subscription: SubscriptionId,
    pub module: String,
    pub error_code: String,
    pub error: String,
}

/// Result of one `publish`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeliveryReport {
    pub event: String,
    pub delivered: usize,
    pub failures: Vec<DeliveryFailure>,
    /// Subscribers removed after the snapshot was taken.
    pub skipped: usize,
}

impl DeliveryReport {
    pub fn all_delivered(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Event bus statistics.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EventStats {
    pub events_published: u64,
    pub deliveries: u64,
    pub delivery_failures: u64,
    pub active_subscriptions: usize,
}

#[derive(Default)]
struct SubscriberTable {
    /// event name → subscriptions in insertion order
    by_event: HashMap<String, Vec<SubscriptionEntry>>,
    /// subscription id → event name
    index: HashMap<SubscriptionId, String>,
}

impl SubscriberTable {
    fn remove_where<P>(&mut self, pred: P) -> Vec<SubscriptionEntry>
    where
        P: Fn(&SubscriptionEntry) -> bool,
    {
        let mut removed = Vec::new();
        for subs in self.by_event.values_mut() {
            let (gone, kept): (Vec<_>, Vec<_>) = subs.drain(..).partition(|s| pred(s));
            *subs = kept;
            removed.extend(gone);
        }
        self.by_event.retain(|_, subs| !subs.is_empty());
        for sub in &removed {
            self.index.remove(&sub.id);
            sub.gate.close();
        }
        removed
    }
}

/// Publish/subscribe fan-out of named events.
pub struct EventBus {
    table: RwLock<SubscriberTable>,
    stats: RwLock<EventStats>,
    timeouts: TimeoutConfig,
    audit: Arc<AuditLog>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("timeouts", &self.timeouts)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(timeouts: TimeoutConfig, audit: Arc<AuditLog>) -> Self {
        Self {
            table: RwLock::new(SubscriberTable::default()),
            stats: RwLock::new(EventStats::default()),
            timeouts,
            audit,
        }
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub async fn subscribe(
        &self,
        owner: &OwnerRef,
        event: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId::new();
        let mut table = self.table.write().await;
        owner.ensure_active()?;

        table
            .by_event
            .entry(event.to_string())
            .or_default()
            .push(SubscriptionEntry {
                id: id.clone(),
                owner: owner.clone(),
                handler,
                gate: CallGate::new(),
            });
        table.index.insert(id.clone(), event.to_string());
        let active = table.index.len();
        drop(table);
        self.stats.write().await.active_subscriptions = active;

        tracing::debug!(event, module = %owner.name(), subscription = %id, "subscribed");
        Ok(id)
    }

    /// Remove one subscription, waiting (bounded) for an in-flight delivery.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        let removed = {
            let mut table = self.table.write().await;
            if !table.index.contains_key(id) {
                return Err(Error::not_found(format!("subscription {} not found", id)));
            }
            let removed = table.remove_where(|s| &s.id == id);
            self.stats.write().await.active_subscriptions = table.index.len();
            removed
        };
        drain_all(
            removed.into_iter().map(|s| s.gate).collect(),
            self.timeouts.unregister_grace,
        )
        .await;
        tracing::debug!(subscription = %id, "unsubscribed");
        Ok(())
    }

    /// Drop every subscription of `owner_id` without waiting.
    pub async fn revoke_module(&self, owner_id: &ModuleId) -> usize {
        let mut table = self.table.write().await;
        let removed = table.remove_where(|s| s.owner.id() == owner_id);
        self.stats.write().await.active_subscriptions = table.index.len();
        removed.len()
    }

    /// Drop every subscription of `owner_id` and wait for in-flight deliveries.
    pub async fn unsubscribe_module(&self, owner_id: &ModuleId) -> usize {
        let removed = {
            let mut table = self.table.write().await;
            let removed = table.remove_where(|s| s.owner.id() == owner_id);
            self.stats.write().await.active_subscriptions = table.index.len();
            removed
        };
        let count = removed.len();
        let lingering = drain_all(
            removed.into_iter().map(|s| s.gate).collect(),
            self.timeouts.unregister_grace,
        )
        .await;
        if lingering > 0 {
            tracing::warn!(module_id = %owner_id, lingering, "unsubscribe_grace_elapsed");
        }
        count
    }

    // =========================================================================
    // Publish
    // =========================================================================

    /// Deliver `event` to every current subscriber in subscription order.
    pub async fn publish(&self, event: Event) -> DeliveryReport {
        let snapshot: Vec<SubscriptionEntry> = self
            .table
            .read()
            .await
            .by_event
            .get(&event.name)
            .cloned()
            .unwrap_or_default();

        let mut report = DeliveryReport {
            event: event.name.clone(),
            ..DeliveryReport::default()
        };

        let budget = CallBudget {
            handler: self.timeouts.handler,
            single_flight_wait: self.timeouts.single_flight_wait,
        };

        for sub in snapshot {
            let handler = sub.handler.clone();
            let event_ref = &event;
            let outcome = sub
                .owner
                .call(&event.name, budget, &sub.gate, async move { handler.handle(event_ref).await })
                .await;
            let CallOutcome::Completed(result) = outcome else {
                report.skipped += 1;
                continue;
            };

            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(
                        event = %event.name,
                        module = %sub.owner.name(),
                        subscription = %sub.id,
                        error = %e,
                        "event_delivery_failed"
                    );
                    self.audit.record(
                        AuditScope::module(sub.owner.id(), sub.owner.name())
                            .with_task(event.task_id.as_ref()),
                        AuditKind::EventDeliveryFailed {
                            event: event.name.clone(),
                            error_code: e.code().to_string(),
                            error: e.to_string(),
                        },
                    );
                    report.failures.push(DeliveryFailure {
                        subscription: sub.id.clone(),
                        module: sub.owner.name().to_string(),
                        error_code: e.code().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let mut stats = self.stats.write().await;
        stats.events_published += 1;
        stats.deliveries += report.delivered as u64;
        stats.delivery_failures += report.failures.len() as u64;
        drop(stats);

        tracing::debug!(
            event = %report.event,
            delivered = report.delivered,
            failed = report.failures.len(),
            "event_published"
        );
        report
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn subscriber_count(&self, event: &str) -> usize {
        self.table
            .read()
            .await
            .by_event
            .get(event)
            .map_or(0, |subs| subs.len())
    }

    /// Number of subscriptions held by `owner_id`.
    pub async fn subscriptions_for(&self, owner_id: &ModuleId) -> usize {
        self.table
            .read()
            .await
            .by_event
            .values()
            .flatten()
            .filter(|s| s.owner.id() == owner_id)
            .count()
    }

    pub async fn stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::health::ModuleHealth;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn bus() -> EventBus {
        let timeouts = TimeoutConfig {
            handler: Duration::from_millis(200),
            unregister_grace: Duration::from_millis(500),
            ..TimeoutConfig::default()
        };
        EventBus::new(timeouts, Arc::new(AuditLog::in_memory()))
    }

    fn owner(name: &str) -> OwnerRef {
        OwnerRef::new(ModuleId::new(), name, false, Arc::new(ModuleHealth::new()))
    }

    fn recorder(log: Arc<Mutex<Vec<String>>>, tag: &'static str) -> Arc<dyn EventHandler> {
        Arc::new(move |_event: Event| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(tag.to_string());
                Ok::<(), Error>(())
            }
        })
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = bus();
        let report = bus.publish(Event::new("nobody.listens", json!({}), "host")).await;
        assert_eq!(report.delivered, 0);
        assert!(report.all_delivered());
        assert_eq!(bus.stats().await.events_published, 1);
    }

    #[tokio::test]
    async fn test_insertion_order_delivery() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(&owner("a"), "tick", recorder(log.clone(), "h1")).await.unwrap();
        bus.subscribe(&owner("b"), "tick", recorder(log.clone(), "h2")).await.unwrap();
        bus.subscribe(&owner("c"), "tick", recorder(log.clone(), "h3")).await.unwrap();

        let report = bus.publish(Event::new("tick", json!(1), "host")).await;
        assert_eq!(report.delivered, 3);
        assert_eq!(*log.lock().unwrap(), vec!["h1", "h2", "h3"]);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failing_handler_does_not_stop_delivery() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let broken = owner("broken");
        let failing: Arc<dyn EventHandler> =
            Arc::new(|_event: Event| async move { Err::<(), Error>(Error::handler("kaput")) });

        bus.subscribe(&broken, "tick", failing).await.unwrap();
        bus.subscribe(&owner("ok"), "tick", recorder(log.clone(), "after")).await.unwrap();

        let report = bus.publish(Event::new("tick", json!(null), "host")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].module, "broken");
        assert_eq!(*log.lock().unwrap(), vec!["after"]);
        assert_eq!(broken.health().consecutive_failures(), 1);
        assert_eq!(bus.audit.len(), 1);
        assert!(logs_contain("event_delivery_failed"));
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_and_delivery_continues() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow: Arc<dyn EventHandler> = Arc::new(|_event: Event| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), Error>(())
        });
        bus.subscribe(&owner("slow"), "tick", slow).await.unwrap();
        bus.subscribe(&owner("fast"), "tick", recorder(log.clone(), "fast")).await.unwrap();

        let report = bus.publish(Event::new("tick", json!(null), "host")).await;
        assert_eq!(report.failures[0].error_code, "TIMEOUT");
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_module_stops_delivery() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let gone = owner("gone");
        let stays = owner("stays");
        bus.subscribe(&gone, "tick", recorder(log.clone(), "gone")).await.unwrap();
        bus.subscribe(&gone, "tock", recorder(log.clone(), "gone")).await.unwrap();
        bus.subscribe(&stays, "tick", recorder(log.clone(), "stays")).await.unwrap();

        assert_eq!(bus.subscriptions_for(gone.id()).await, 2);
        assert_eq!(bus.unsubscribe_module(gone.id()).await, 2);

        bus.publish(Event::new("tick", json!(null), "host")).await;
        bus.publish(Event::new("tock", json!(null), "host")).await;
        assert_eq!(*log.lock().unwrap(), vec!["stays"]);
        assert_eq!(bus.subscriber_count("tock").await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_id() {
        let bus = bus();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(&owner("a"), "tick", recorder(log.clone(), "a")).await.unwrap();
        bus.unsubscribe(&id).await.unwrap();
        assert!(matches!(bus.unsubscribe(&id).await, Err(Error::NotFound(_))));

        bus.publish(Event::new("tick", json!(null), "host")).await;
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(bus.stats().await.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_queued_delivery_skipped_after_revocation() {
        let bus = Arc::new(bus());
        let lane_owner = OwnerRef::new(ModuleId::new(), "serial", true, Arc::new(ModuleHealth::new()));
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let slow: Arc<dyn EventHandler> = {
            let hits = hits.clone();
            Arc::new(move |_event: Event| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<(), Error>(())
                }
            })
        };
        bus.subscribe(&lane_owner, "tick", slow).await.unwrap();

        let publish = || {
            let bus = bus.clone();
            tokio::spawn(async move { bus.publish(Event::new("tick", json!(null), "host")).await })
        };
        let first = publish();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = publish();
        tokio::time::sleep(Duration::from_millis(20)).await;

        lane_owner.revoke();
        bus.revoke_module(lane_owner.id()).await;

        assert_eq!(first.await.unwrap().delivered, 1);
        let second = second.await.unwrap();
        assert_eq!(second.delivered, 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_revoked_owner_cannot_subscribe() {
        let bus = bus();
        let m = owner("m");
        m.revoke();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert!(bus.subscribe(&m, "tick", recorder(log, "m")).await.is_err());
    }
}
