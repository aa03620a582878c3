use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The kind of client activity that produced an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventOp {
    /// A simple-protocol `Query` message.
    Query,
    /// An extended-protocol `Execute` message.
    Execute,
    /// A query whose text opens a transaction block.
    Begin,
    /// A query whose text commits the active transaction block.
    Commit,
    /// A query whose text rolls back the active transaction block.
    Rollback,
}

impl EventOp {
    /// Whether this operation marks a transaction boundary.
    pub fn is_tx_boundary(self) -> bool {
        matches!(self, EventOp::Begin | EventOp::Commit | EventOp::Rollback)
    }
}

/// A captured query event, emitted when the proxy observes a client message
/// that starts a query.
///
/// Events are immutable once emitted. The `query` field is empty for
/// transaction-boundary operations because the triggering SQL text already
/// carries the keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Per-connection identifier: the decimal form of a counter starting at 1.
    pub id: String,
    pub op: EventOp,
    /// SQL text as sent by the client.
    pub query: String,
    /// Bound parameter values for extended-protocol executes, in order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// When the proxy observed the triggering client message.
    pub start_time: DateTime<Utc>,
    /// Synthetic transaction identifier, or empty outside a transaction.
    /// A `Commit`/`Rollback` event carries the identifier it terminates.
    pub tx_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn serializes_ops_uppercase_and_skips_absent_args() {
        let event = Event {
            id: "1".to_string(),
            op: EventOp::Query,
            query: "SELECT 1".to_string(),
            args: None,
            start_time: Utc::now(),
            tx_id: String::new(),
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["op"], "QUERY");
        assert_eq!(json["query"], "SELECT 1");
        assert!(json.get("args").is_none());

        let event = Event {
            op: EventOp::Execute,
            args: Some(vec!["1".to_string(), "2".to_string()]),
            ..event
        };
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["op"], "EXECUTE");
        assert_eq!(json["args"][0], "1");
        assert_eq!(json["args"][1], "2");
    }

    #[test]
    fn round_trips_through_json() {
        let event = Event {
            id: "7".to_string(),
            op: EventOp::Begin,
            query: String::new(),
            args: None,
            start_time: Utc::now(),
            tx_id: "2b6860ec-6b3c-4e12-9f54-9e6e9f2a3c11".to_string(),
        };
        let json = serde_json::to_string(&event).expect("serialize");
        let back: Event = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.id, event.id);
        assert_eq!(back.op, EventOp::Begin);
        assert_eq!(back.tx_id, event.tx_id);
        assert_eq!(back.args, None);
    }
}
