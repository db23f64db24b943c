//! Messages exchanged between query clients over a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A synchronization message about one query or mutation.
///
/// Keys are cache keys (`base::params`), so a receiver can match a message
/// against its own instances without knowing their parameter types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum QueryBroadcastMessage {
    /// The query's data is out of date.
    Invalidate { query_key: String },

    /// Refetch the query now.
    Refetch { query_key: String },

    /// The query has new data.
    QueryUpdated {
        query_key: String,
        data: Option<JsonValue>,
    },

    MutationSuccess {
        mutation_key: String,
        data: Option<JsonValue>,
        variables: Option<JsonValue>,
    },

    MutationError {
        mutation_key: String,
        error: String,
        variables: Option<JsonValue>,
    },
}

impl QueryBroadcastMessage {
    pub fn invalidate(query_key: impl Into<String>) -> Self {
        Self::Invalidate {
            query_key: query_key.into(),
        }
    }

    pub fn refetch(query_key: impl Into<String>) -> Self {
        Self::Refetch {
            query_key: query_key.into(),
        }
    }

    /// The query key this message targets, if it targets a query.
    pub fn query_key(&self) -> Option<&str> {
        match self {
            Self::Invalidate { query_key }
            | Self::Refetch { query_key }
            | Self::QueryUpdated { query_key, .. } => Some(query_key),
            Self::MutationSuccess { .. } | Self::MutationError { .. } => None,
        }
    }

    /// Get the message type as a string.
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Invalidate { .. } => "invalidate",
            Self::Refetch { .. } => "refetch",
            Self::QueryUpdated { .. } => "queryUpdated",
            Self::MutationSuccess { .. } => "mutationSuccess",
            Self::MutationError { .. } => "mutationError",
        }
    }
}

/// A message plus the id of the client that posted it.
///
/// Receivers skip messages carrying their own origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    pub origin: Uuid,
    pub message: QueryBroadcastMessage,
}

impl ChannelMessage {
    pub fn new(origin: Uuid, message: QueryBroadcastMessage) -> Self {
        Self { origin, message }
    }

    pub fn is_from(&self, origin: Uuid) -> bool {
        self.origin == origin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_format_is_tagged() {
        let msg = QueryBroadcastMessage::QueryUpdated {
            query_key: "todos::null".to_string(),
            data: Some(json!([1, 2])),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "queryUpdated", "queryKey": "todos::null", "data": [1, 2]})
        );
        let back: QueryBroadcastMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_query_key_and_type() {
        let msg = QueryBroadcastMessage::invalidate("a");
        assert_eq!(msg.query_key(), Some("a"));
        assert_eq!(msg.message_type(), "invalidate");

        let mutation = QueryBroadcastMessage::MutationError {
            mutation_key: "save".to_string(),
            error: "conflict".to_string(),
            variables: None,
        };
        assert_eq!(mutation.query_key(), None);
        assert_eq!(mutation.message_type(), "mutationError");
    }

    #[test]
    fn test_origin_check() {
        let origin = Uuid::now_v7();
        let msg = ChannelMessage::new(origin, QueryBroadcastMessage::refetch("k"));
        assert!(msg.is_from(origin));
        assert!(!msg.is_from(Uuid::now_v7()));
    }
}
