//! Read-only views handed to a presenter.
//!
//! Views are plain owned values. A presenter re-reads them when an
//! [`EngineEvent`](crate::events::EngineEvent) tells it something changed;
//! [`EngineSnapshot`] bundles all of them into one serializable value.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::cache::{CacheStats, SummaryRecord};
use crate::error::EngineError;
use crate::model::{Chat, Item, List, ListId};
use crate::selection::ActiveSelection;

/// Item state of one list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ItemsView {
    pub items: Vec<Item>,
    /// A fetch is in flight.
    pub loading: bool,
    /// Error of the last failed fetch, cleared by the next success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

/// Item state of the active list.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActiveItemsView {
    pub list: Option<ListId>,
    pub items: Vec<Item>,
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

impl ActiveItemsView {
    pub fn new(list: ListId, view: ItemsView) -> Self {
        Self {
            list: Some(list),
            items: view.items,
            loading: view.loading,
            error: view.error,
        }
    }
}

/// Hydration state of the list collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LoadStatus {
    pub loading: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<EngineError>,
}

/// Everything a presenter can observe, at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub lists: Vec<List>,
    pub status: LoadStatus,
    pub selection: ActiveSelection,
    pub active: ActiveItemsView,
    /// Chats of the active list.
    pub chats: Vec<Chat>,
    pub items: BTreeMap<ListId, ItemsView>,
    pub summaries: BTreeMap<ListId, SummaryRecord>,
    pub stats: CacheStats,
}

impl EngineSnapshot {
    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::invalid_state(format!("snapshot not serializable: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keys_lists_by_id() {
        let list = ListId(1);
        let snapshot = EngineSnapshot {
            lists: vec![List {
                id: list,
                name: "RAG".into(),
                sources: vec![],
                item_count: 0,
            }],
            status: LoadStatus::default(),
            selection: ActiveSelection {
                list: Some(list),
                chat: None,
            },
            active: ActiveItemsView::new(list, ItemsView::default()),
            chats: vec![],
            items: BTreeMap::from([(list, ItemsView::default())]),
            summaries: BTreeMap::from([(
                list,
                SummaryRecord::Completed {
                    text: "text".into(),
                    model: None,
                },
            )]),
            stats: CacheStats::default(),
        };

        let json: serde_json::Value = serde_json::from_str(&snapshot.to_json().unwrap()).unwrap();
        assert_eq!(json["summaries"]["1"]["status"], "completed");
        assert_eq!(json["items"]["1"]["loading"], false);
        assert_eq!(json["selection"]["list"], 1);
        assert!(json["selection"]["chat"].is_null());
        assert_eq!(json["lists"][0]["listSources"], serde_json::json!([]));
        assert!(json["active"].get("error").is_none());
    }
}
