use serde::{Deserialize, Serialize};

use crate::{
    domain::{ItemId, ShoppingItem},
    error::ListError,
};

/// A user-triggered action against the shopping list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Intent {
    Refresh,
    AddItem { name: String },
    ToggleBought { id: ItemId },
    DeleteItem { id: ItemId },
    EditItem { id: ItemId, name: String },
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Refresh => "refresh",
            Intent::AddItem { .. } => "add_item",
            Intent::ToggleBought { .. } => "toggle_bought",
            Intent::DeleteItem { .. } => "delete_item",
            Intent::EditItem { .. } => "edit_item",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ListEvent {
    RefreshStarted { generation: u64 },
    RefreshFinished { generation: u64 },
    ProjectionChanged { items: Vec<ShoppingItem> },
    Rejected { intent: Intent, error: ListError },
    Error(ListError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn intent_uses_tagged_wire_shape() {
        let intent = Intent::EditItem {
            id: ItemId(4),
            name: "Oat milk".into(),
        };
        let json = serde_json::to_value(&intent).expect("serialize");
        assert_eq!(json["type"], "edit_item");
        assert_eq!(json["payload"]["id"], 4);
        assert_eq!(json["payload"]["name"], "Oat milk");

        let refresh = serde_json::to_value(Intent::Refresh).expect("serialize");
        assert_eq!(refresh["type"], "refresh");
    }

    #[test]
    fn error_event_carries_code() {
        let event = ListEvent::Error(ListError::storage_unavailable("disk gone"));
        let json = serde_json::to_value(&event).expect("serialize");
        assert_eq!(json["type"], "error");
        assert_eq!(json["payload"]["code"], "storage_unavailable");

        let decoded: ListEvent = serde_json::from_value(json).expect("deserialize");
        match decoded {
            ListEvent::Error(err) => assert_eq!(err.code, ErrorCode::StorageUnavailable),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
