//! Realtime change feed over WebSocket.
//!
//! Clients subscribe to row changes by topic:
//!
//! ```json
//! {"action": "subscribe", "topic": "incoming", "table": "orders",
//!  "event": "INSERT", "filter": "performer_id=eq.<uuid>"}
//! ```
//!
//! and receive `{"type": "postgres_changes", "data": {"topic": ..., "payload": ...}}`
//! for every matching commit.

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::api::server::AppState;
use crate::events::{ChangeEvent, EventManager, Subscription};

const DEFAULT_HEARTBEAT_SECS: u64 = 30;
const MIN_HEARTBEAT_SECS: u64 = 5;

/// Events sent to realtime clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RealtimeEvent {
    /// A committed row change matching one of the client's topics
    #[serde(rename = "postgres_changes")]
    Change(ChangeNotification),

    #[serde(rename = "subscription")]
    Subscription(SubscriptionEvent),

    #[serde(rename = "error")]
    Error(ErrorEvent),

    #[serde(rename = "ping")]
    Ping(PingEvent),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub topic: String,
    pub payload: ChangeEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Topics active after this message
    pub topics: Vec<String>,
    pub success: bool,
    pub client_id: String,
    pub message: String,
    /// Echo of the request id
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub code: u32,
    pub message: String,
    pub details: Option<String>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingEvent {
    pub timestamp: u64,
    pub client_id: String,
}

/// Message from a realtime client
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    /// Correlates replies with requests
    pub id: Option<String>,
    pub action: String,
    pub topic: Option<String>,
    pub table: Option<String>,
    /// `INSERT`, `UPDATE`, `DELETE` or `*`
    pub event: Option<String>,
    /// `column=eq.value`
    pub filter: Option<String>,
    /// Heartbeat interval in seconds
    pub heartbeat_interval: Option<u64>,
}

type Topics = Arc<RwLock<HashMap<String, Subscription>>>;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let events = state.events.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, events))
}

fn topic_names(topics: &Topics) -> Vec<String> {
    let mut names: Vec<String> = topics.read().keys().cloned().collect();
    names.sort();
    names
}

fn now_secs() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

/// Apply one client message, returning the reply
fn handle_client_message(
    msg: ClientMessage,
    topics: &Topics,
    client_id: &str,
    heartbeat_tx: &tokio::sync::watch::Sender<u64>,
) -> RealtimeEvent {
    let error = |message: &str, details: Option<String>, id: Option<String>| {
        RealtimeEvent::Error(ErrorEvent {
            code: 400,
            message: message.to_string(),
            details,
            id,
        })
    };

    match msg.action.as_str() {
        "subscribe" => {
            let Some(table) = msg.table.as_deref() else {
                return error("Missing table", None, msg.id);
            };
            let subscription =
                match Subscription::parse(table, msg.event.as_deref(), msg.filter.as_deref()) {
                    Ok(subscription) => subscription,
                    Err(reason) => return error("Invalid subscription", Some(reason), msg.id),
                };
            let topic = msg.topic.unwrap_or_else(|| table.to_string());
            log::debug!("Realtime client {} subscribed to {}", client_id, topic);
            topics.write().insert(topic, subscription);
            RealtimeEvent::Subscription(SubscriptionEvent {
                topics: topic_names(topics),
                success: true,
                client_id: client_id.to_string(),
                message: "Subscriptions updated successfully".to_string(),
                id: msg.id,
            })
        }
        "unsubscribe" => {
            match msg.topic {
                Some(topic) => {
                    topics.write().remove(&topic);
                }
                None => topics.write().clear(),
            }
            RealtimeEvent::Subscription(SubscriptionEvent {
                topics: topic_names(topics),
                success: true,
                client_id: client_id.to_string(),
                message: "Unsubscribed successfully".to_string(),
                id: msg.id,
            })
        }
        "ping" => {
            if let Some(secs) = msg.heartbeat_interval {
                let _ = heartbeat_tx.send(secs.max(MIN_HEARTBEAT_SECS));
            }
            RealtimeEvent::Ping(PingEvent {
                timestamp: now_secs(),
                client_id: client_id.to_string(),
            })
        }
        other => error(
            "Unknown action",
            Some(format!("Action '{}' not recognized", other)),
            msg.id,
        ),
    }
}

/// Notifications owed to this client for one committed change
fn route_change(topics: &Topics, change: &ChangeEvent) -> Vec<RealtimeEvent> {
    topics
        .read()
        .iter()
        .filter(|(_, subscription)| subscription.matches(change))
        .map(|(topic, _)| {
            RealtimeEvent::Change(ChangeNotification {
                topic: topic.clone(),
                payload: change.clone(),
            })
        })
        .collect()
}

async fn handle_socket(socket: WebSocket, events: Arc<EventManager>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<RealtimeEvent>(1000);
    let client_id = Uuid::new_v4().to_string();
    let topics: Topics = Arc::new(RwLock::new(HashMap::new()));
    let (heartbeat_tx, mut heartbeat_rx) = tokio::sync::watch::channel(DEFAULT_HEARTBEAT_SECS);
    let mut changes = events.subscribe();

    log::debug!("Realtime client {} connected", client_id);

    let welcome = RealtimeEvent::Subscription(SubscriptionEvent {
        topics: Vec::new(),
        success: true,
        client_id: client_id.clone(),
        message: "Connected to BMB realtime".to_string(),
        id: None,
    });
    let _ = tx.send(welcome).await;

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("Failed to encode realtime event: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv_client_id = client_id.clone();
    let recv_topics = topics.clone();
    let recv_tx = tx.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(client_msg) => handle_client_message(
                            client_msg,
                            &recv_topics,
                            &recv_client_id,
                            &heartbeat_tx,
                        ),
                        Err(e) => RealtimeEvent::Error(ErrorEvent {
                            code: 400,
                            message: "Invalid JSON".to_string(),
                            details: Some(e.to_string()),
                            id: None,
                        }),
                    };
                    if recv_tx.send(reply).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    let event_client_id = client_id.clone();
    let event_topics = topics.clone();
    let event_tx = tx;
    let mut event_task = tokio::spawn(async move {
        let mut heartbeat = Duration::from_secs(*heartbeat_rx.borrow());
        loop {
            tokio::select! {
                change = changes.recv() => match change {
                    Ok(change) => {
                        for event in route_change(&event_topics, &change) {
                            if event_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Realtime client {} lagged, {} changes dropped", event_client_id, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = heartbeat_rx.changed() => {
                    // the receive side is gone
                    if changed.is_err() {
                        return;
                    }
                    heartbeat = Duration::from_secs(*heartbeat_rx.borrow());
                }
                _ = tokio::time::sleep(heartbeat) => {
                    let ping = RealtimeEvent::Ping(PingEvent {
                        timestamp: now_secs(),
                        client_id: event_client_id.clone(),
                    });
                    if event_tx.send(ping).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            event_task.abort();
        },
        _ = &mut recv_task => {
            send_task.abort();
            event_task.abort();
        },
        _ = &mut event_task => {
            send_task.abort();
            recv_task.abort();
        }
    };

    log::debug!("Realtime client {} disconnected", client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Table;
    use serde_json::json;

    fn message(value: serde_json::Value) -> ClientMessage {
        serde_json::from_value(value).unwrap()
    }

    fn setup() -> (Topics, tokio::sync::watch::Sender<u64>) {
        let (tx, _rx) = tokio::sync::watch::channel(DEFAULT_HEARTBEAT_SECS);
        (Arc::new(RwLock::new(HashMap::new())), tx)
    }

    #[test]
    fn subscribe_registers_topic() {
        let (topics, hb) = setup();
        let reply = handle_client_message(
            message(json!({
                "id": "1",
                "action": "subscribe",
                "topic": "incoming",
                "table": "orders",
                "event": "INSERT",
                "filter": "performer_id=eq.abc"
            })),
            &topics,
            "client",
            &hb,
        );
        match reply {
            RealtimeEvent::Subscription(ev) => {
                assert!(ev.success);
                assert_eq!(ev.topics, vec!["incoming".to_string()]);
                assert_eq!(ev.id.as_deref(), Some("1"));
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn bad_subscription_is_an_error() {
        let (topics, hb) = setup();
        let reply = handle_client_message(
            message(json!({"action": "subscribe", "table": "wallets"})),
            &topics,
            "client",
            &hb,
        );
        assert!(matches!(reply, RealtimeEvent::Error(ErrorEvent { code: 400, .. })));
        assert!(topics.read().is_empty());

        let reply = handle_client_message(message(json!({"action": "dance"})), &topics, "client", &hb);
        match reply {
            RealtimeEvent::Error(ev) => assert_eq!(ev.message, "Unknown action"),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn changes_route_to_matching_topics() {
        let (topics, hb) = setup();
        for (topic, filter) in [("mine", "performer_id=eq.p1"), ("theirs", "performer_id=eq.p2")] {
            handle_client_message(
                message(json!({"action": "subscribe", "topic": topic, "table": "orders", "filter": filter})),
                &topics,
                "client",
                &hb,
            );
        }

        let events = EventManager::new(8);
        let mut rx = events.subscribe();
        events.publish_insert(Table::Orders, &json!({"id": 1, "performer_id": "p1"}));
        let change = rx.try_recv().unwrap();

        let routed = route_change(&topics, &change);
        assert_eq!(routed.len(), 1);
        match &routed[0] {
            RealtimeEvent::Change(n) => assert_eq!(n.topic, "mine"),
            other => panic!("unexpected event {:?}", other),
        }

        handle_client_message(message(json!({"action": "unsubscribe"})), &topics, "client", &hb);
        assert!(route_change(&topics, &change).is_empty());
    }

    #[test]
    fn change_events_use_tagged_encoding() {
        let events = EventManager::new(8);
        let mut rx = events.subscribe();
        events.publish_delete(Table::Scenarios, &json!({"id": 3}));
        let event = RealtimeEvent::Change(ChangeNotification {
            topic: "catalog".into(),
            payload: rx.try_recv().unwrap(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "postgres_changes");
        assert_eq!(value["data"]["payload"]["event_type"], "DELETE");
        assert_eq!(value["data"]["payload"]["old"]["id"], 3);
    }

    #[test]
    fn ping_adjusts_heartbeat() {
        let (topics, _) = setup();
        let (hb, rx) = tokio::sync::watch::channel(DEFAULT_HEARTBEAT_SECS);
        handle_client_message(
            message(json!({"action": "ping", "heartbeat_interval": 1})),
            &topics,
            "client",
            &hb,
        );
        assert_eq!(*rx.borrow(), MIN_HEARTBEAT_SECS);
    }
}
