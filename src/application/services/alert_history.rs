use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::entities::alert::{AlertEvent, AlertKind};

/// Remembers when each `(subject, kind)` alert was last surfaced and holds
/// back repeats inside the quiet period.
#[derive(Debug)]
pub struct AlertHistory {
    quiet_period: Duration,
    last_surfaced: Mutex<HashMap<(String, AlertKind), DateTime<Utc>>>,
}

impl AlertHistory {
    pub fn new(quiet_period: Duration) -> Self {
        Self {
            quiet_period,
            last_surfaced: Mutex::new(HashMap::new()),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Keep the events not surfaced within the quiet period before `now`,
    /// and remember them as surfaced at `now`.
    pub async fn filter_at(&self, events: Vec<AlertEvent>, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let mut last_surfaced = self.last_surfaced.lock().await;
        let before = events.len();

        let fresh: Vec<AlertEvent> = events
            .into_iter()
            .filter(|event| {
                let id = (event.subject_id.clone(), event.kind);
                match last_surfaced.get(&id) {
                    Some(at) if now - *at < self.quiet_period => false,
                    _ => {
                        last_surfaced.insert(id, now);
                        true
                    }
                }
            })
            .collect();

        if fresh.len() < before {
            debug!(
                suppressed = before - fresh.len(),
                quiet_period_mins = self.quiet_period.num_minutes(),
                "Alerts suppressed by quiet period"
            );
        }
        fresh
    }

    pub async fn clear(&self) {
        self.last_surfaced.lock().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::alert::Severity;

    fn low_stock(item: &str, at: DateTime<Utc>) -> AlertEvent {
        AlertEvent::new(
            AlertKind::LowStock,
            Severity::Medium,
            item,
            format!("{} is low", item),
            at,
        )
    }

    #[tokio::test]
    async fn test_repeat_within_quiet_period_is_suppressed() {
        let history = AlertHistory::new(Duration::minutes(30));
        let t0 = Utc::now();

        let first = history.filter_at(vec![low_stock("Widget", t0)], t0).await;
        assert_eq!(first.len(), 1);

        let t1 = t0 + Duration::minutes(10);
        let second = history
            .filter_at(vec![low_stock("Widget", t1), low_stock("Gadget", t1)], t1)
            .await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].subject_id, "Gadget");
    }

    #[tokio::test]
    async fn test_alert_resurfaces_after_quiet_period() {
        let history = AlertHistory::new(Duration::minutes(30));
        let t0 = Utc::now();
        history.filter_at(vec![low_stock("Widget", t0)], t0).await;

        let later = t0 + Duration::minutes(31);
        let again = history.filter_at(vec![low_stock("Widget", later)], later).await;
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_forgets_history() {
        let history = AlertHistory::new(Duration::hours(1));
        let t0 = Utc::now();
        history.filter_at(vec![low_stock("Widget", t0)], t0).await;
        history.clear().await;
        assert_eq!(
            history.filter_at(vec![low_stock("Widget", t0)], t0).await.len(),
            1
        );
    }
}
