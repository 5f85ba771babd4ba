//! Data model: lists, their source bindings and filters, items and chats.
//!
//! JSON field names follow the Omni backend's wire shape (camelCase,
//! `listSources`, `dataSourceId`, `dateRange`) so the same types serve the
//! REST adapter and presenter snapshots.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::EngineError;

// ── Identifiers ────────────────────────────────────────────────────

/// Opaque, server-assigned list identifier. Immutable once created.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListId(pub u64);

impl fmt::Display for ListId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a conversation within a list's chat collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub u64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of an aggregated item.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub u64);

/// Identifier of a configured data source (e.g. `"twitter"`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataSourceId(pub String);

impl DataSourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DataSourceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for DataSourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The user on whose behalf every data source call is made.
///
/// Passed explicitly into each [`DataSource`](crate::source::DataSource)
/// call instead of living in a global.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserContext {
    pub email: String,
}

impl UserContext {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
        }
    }
}

// ── Filters and bindings ───────────────────────────────────────────

/// Inclusive date window applied to a source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, EngineError> {
        let range = Self { from, to };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.from > self.to {
            return Err(EngineError::invalid_state(format!(
                "date range starts after it ends ({} > {})",
                self.from, self.to
            )));
        }
        Ok(())
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }
}

/// Filter parameters for one source binding. Interpretation is up to the
/// data source; the engine only stores, merges and forwards them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFilters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
}

impl SourceFilters {
    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(range) = &self.date_range {
            range.validate()?;
        }
        Ok(())
    }
}

/// Partial filter update. Present fields overwrite, absent fields keep
/// their current value.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rag_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
}

impl FilterPatch {
    pub fn is_empty(&self) -> bool {
        self.date_range.is_none()
            && self.rag_query.is_none()
            && self.threshold.is_none()
            && self.authors.is_none()
    }

    /// Shallow-merge into `filters`. Returns whether anything changed.
    pub fn apply(&self, filters: &mut SourceFilters) -> bool {
        let before = filters.clone();
        if let Some(range) = self.date_range {
            filters.date_range = Some(range);
        }
        if let Some(query) = &self.rag_query {
            filters.rag_query = Some(query.clone());
        }
        if let Some(threshold) = self.threshold {
            filters.threshold = Some(threshold);
        }
        if let Some(authors) = &self.authors {
            filters.authors = authors.clone();
        }
        *filters != before
    }
}

/// A (data source, filter parameters) pair attached to a list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBinding {
    pub data_source_id: DataSourceId,
    #[serde(default)]
    pub filters: SourceFilters,
}

impl SourceBinding {
    pub fn new(data_source_id: impl Into<DataSourceId>, filters: SourceFilters) -> Self {
        Self {
            data_source_id: data_source_id.into(),
            filters,
        }
    }
}

// ── Lists ──────────────────────────────────────────────────────────

/// A named, user-defined grouping of items drawn from its source bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct List {
    pub id: ListId,
    pub name: String,
    #[serde(rename = "listSources", default)]
    pub sources: Vec<SourceBinding>,
    #[serde(default)]
    pub item_count: u64,
}

impl List {
    pub fn binding(&self, data_source_id: &DataSourceId) -> Option<&SourceBinding> {
        self.sources
            .iter()
            .find(|b| &b.data_source_id == data_source_id)
    }

    /// Insert `binding`, replacing an existing binding for the same source.
    pub fn upsert_binding(&mut self, binding: SourceBinding) {
        match self
            .sources
            .iter_mut()
            .find(|b| b.data_source_id == binding.data_source_id)
        {
            Some(existing) => *existing = binding,
            None => self.sources.push(binding),
        }
    }

    /// Remove the binding for `data_source_id`. Returns whether one existed.
    pub fn remove_binding(&mut self, data_source_id: &DataSourceId) -> bool {
        let before = self.sources.len();
        self.sources.retain(|b| &b.data_source_id != data_source_id);
        self.sources.len() != before
    }

    /// Date range of the first binding, the one the list header displays.
    pub fn date_range(&self) -> Option<DateRange> {
        self.sources.first().and_then(|b| b.filters.date_range)
    }
}

/// Input for creating a list. The server assigns the identifier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListDraft {
    pub name: String,
    #[serde(rename = "listSources", default)]
    pub sources: Vec<SourceBinding>,
}

impl ListDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_source(mut self, binding: SourceBinding) -> Self {
        self.sources.push(binding);
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::invalid_state("list name is required"));
        }
        self.sources.iter().try_for_each(|b| b.filters.validate())
    }
}

/// Permitted list fields for `update`. `None` leaves the field unchanged.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(
        rename = "listSources",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sources: Option<Vec<SourceBinding>>,
}

impl ListPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            sources: None,
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceBinding>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.sources.is_none()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(EngineError::invalid_state("list name cannot be blank"));
        }
        if let Some(sources) = &self.sources {
            sources.iter().try_for_each(|b| b.filters.validate())?;
        }
        Ok(())
    }

    /// Merge into `list`. The identifier is never touched.
    pub fn apply(&self, list: &mut List) {
        if let Some(name) = &self.name {
            list.name = name.clone();
        }
        if let Some(sources) = &self.sources {
            list.sources = sources.clone();
        }
    }
}

// ── Items ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub name: String,
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// An opaque unit of aggregated content (e.g. a post) in a list's view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: ItemId,
    #[serde(rename = "type", default = "default_item_kind")]
    pub kind: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Author>,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub reactions: u64,
    #[serde(default)]
    pub timestamp: String,
}

fn default_item_kind() -> String {
    "tweet".to_string()
}

impl Item {
    pub fn new(id: u64, content: impl Into<String>) -> Self {
        Self {
            id: ItemId(id),
            kind: default_item_kind(),
            content: content.into(),
            author: None,
            likes: 0,
            reactions: 0,
            timestamp: String::new(),
        }
    }

    pub fn with_author(mut self, name: impl Into<String>, handle: impl Into<String>) -> Self {
        self.author = Some(Author {
            name: name.into(),
            handle: handle.into(),
            avatar_url: None,
        });
        self
    }

    /// Text used when the item is fed into a conversational context.
    pub fn context_line(&self) -> String {
        match &self.author {
            Some(author) => format!("{}: {}", author.handle, self.content),
            None => self.content.clone(),
        }
    }
}

/// Live-update patch for a cached item.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<u64>,
}

impl ItemPatch {
    pub fn apply(&self, item: &mut Item) {
        if let Some(content) = &self.content {
            item.content = content.clone();
        }
        if let Some(likes) = self.likes {
            item.likes = likes;
        }
        if let Some(reactions) = self.reactions {
            item.reactions = reactions;
        }
    }
}

// ── Chats ──────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
}

/// A conversation bound to one list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Chat {
    pub fn new(id: u64) -> Self {
        Self {
            id: ChatId(id),
            messages: Vec::new(),
        }
    }

    /// First user message, shown as the conversation title.
    pub fn question(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}
