//! Row change feed.
//!
//! Every committed write publishes a [`ChangeEvent`] on a broadcast channel.
//! Realtime clients hold [`Subscription`]s that select events by table, kind
//! and an optional `column=eq.value` filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Profiles,
    Scenarios,
    Orders,
    DisputeVotes,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Profiles => "profiles",
            Table::Scenarios => "scenarios",
            Table::Orders => "orders",
            Table::DisputeVotes => "dispute_votes",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "profiles" => Ok(Table::Profiles),
            "scenarios" => Ok(Table::Scenarios),
            "orders" => Ok(Table::Orders),
            "dispute_votes" => Ok(Table::DisputeVotes),
            other => Err(format!("unknown table: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: Table,
    pub event_type: ChangeKind,
    #[serde(rename = "new")]
    pub new_record: Option<Value>,
    #[serde(rename = "old")]
    pub old_record: Option<Value>,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Row the filter is matched against
    pub fn record(&self) -> Option<&Value> {
        self.new_record.as_ref().or(self.old_record.as_ref())
    }
}

/// `column=eq.value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub column: String,
    pub value: String,
}

impl FromStr for ChangeFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (column, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("filter '{s}' is not of the form column=eq.value"))?;
        let value = rest
            .strip_prefix("eq.")
            .ok_or_else(|| format!("filter '{s}' only supports the eq operator"))?;
        if column.is_empty() {
            return Err(format!("filter '{s}' has no column"));
        }
        Ok(Self {
            column: column.to_string(),
            value: value.to_string(),
        })
    }
}

impl ChangeFilter {
    pub fn matches(&self, record: &Value) -> bool {
        match record.get(&self.column) {
            Some(Value::String(s)) => s == &self.value,
            Some(Value::Null) | None => false,
            Some(other) => other.to_string() == self.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub table: Table,
    /// `None` selects every kind (`*`)
    pub event: Option<ChangeKind>,
    pub filter: Option<ChangeFilter>,
}

impl Subscription {
    pub fn parse(table: &str, event: Option<&str>, filter: Option<&str>) -> Result<Self, String> {
        let table = table.parse()?;
        let event = match event.unwrap_or("*") {
            "*" => None,
            "INSERT" => Some(ChangeKind::Insert),
            "UPDATE" => Some(ChangeKind::Update),
            "DELETE" => Some(ChangeKind::Delete),
            other => return Err(format!("unknown event: {other}")),
        };
        let filter = filter.map(str::parse).transpose()?;
        Ok(Self {
            table,
            event,
            filter,
        })
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table {
            return false;
        }
        if self.event.is_some_and(|kind| kind != event.event_type) {
            return false;
        }
        match (&self.filter, event.record()) {
            (None, _) => true,
            (Some(filter), Some(record)) => filter.matches(record),
            (Some(_), None) => false,
        }
    }
}

/// Broadcasts row changes to every listener
#[derive(Clone)]
pub struct EventManager {
    change_tx: broadcast::Sender<ChangeEvent>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (change_tx, _) = broadcast::channel(capacity);
        Self { change_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.change_tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.change_tx.receiver_count()
    }

    fn publish(&self, table: Table, event_type: ChangeKind, new: Option<Value>, old: Option<Value>) {
        let event = ChangeEvent {
            table,
            event_type,
            new_record: new,
            old_record: old,
            commit_timestamp: Utc::now(),
        };
        // no listeners is fine
        let _ = self.change_tx.send(event);
    }

    pub fn publish_insert<T: Serialize>(&self, table: Table, record: &T) {
        self.publish(table, ChangeKind::Insert, to_value(record), None);
    }

    pub fn publish_update<T: Serialize>(&self, table: Table, old: &T, new: &T) {
        self.publish(table, ChangeKind::Update, to_value(new), to_value(old));
    }

    pub fn publish_delete<T: Serialize>(&self, table: Table, old: &T) {
        self.publish(table, ChangeKind::Delete, None, to_value(old));
    }
}

fn to_value<T: Serialize>(record: &T) -> Option<Value> {
    match serde_json::to_value(record) {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Failed to serialize change record: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn filter_parsing() {
        let filter: ChangeFilter = "performer_id=eq.abc".parse().unwrap();
        assert_eq!(filter.column, "performer_id");
        assert_eq!(filter.value, "abc");
        assert!("performer_id=neq.abc".parse::<ChangeFilter>().is_err());
        assert!("performer_id".parse::<ChangeFilter>().is_err());
    }

    #[test]
    fn filter_matches_strings_and_numbers() {
        let by_user: ChangeFilter = "customer_id=eq.u1".parse().unwrap();
        let by_id: ChangeFilter = "id=eq.7".parse().unwrap();
        let row = json!({"id": 7, "customer_id": "u1"});
        assert!(by_user.matches(&row));
        assert!(by_id.matches(&row));
        assert!(!by_user.matches(&json!({"customer_id": "u2"})));
    }

    #[tokio::test]
    async fn subscription_selects_table_kind_and_row() {
        let events = EventManager::default();
        let mut rx = events.subscribe();
        let sub = Subscription::parse("orders", Some("UPDATE"), Some("performer_id=eq.p1")).unwrap();

        events.publish_insert(Table::Orders, &json!({"performer_id": "p1"}));
        events.publish_update(
            Table::Orders,
            &json!({"performer_id": "p1", "status": "pending"}),
            &json!({"performer_id": "p1", "status": "in_progress"}),
        );
        events.publish_delete(Table::Scenarios, &json!({"id": 1}));

        let received: Vec<_> = (0..3).map(|_| rx.try_recv().unwrap()).collect();
        let matched: Vec<_> = received.iter().filter(|e| sub.matches(e)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].event_type, ChangeKind::Update);
        assert_eq!(matched[0].old_record.as_ref().unwrap()["status"], "pending");
    }

    #[test]
    fn wildcard_event_and_unknown_table() {
        let sub = Subscription::parse("dispute_votes", Some("*"), None).unwrap();
        assert_eq!(sub.event, None);
        assert!(Subscription::parse("wallets", None, None).is_err());
        assert!(Subscription::parse("orders", Some("UPSERT"), None).is_err());
    }
}
