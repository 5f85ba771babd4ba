//! Active list and chat selection.

pub mod chat;
pub mod coordinator;

pub use chat::ChatCatalog;
pub use coordinator::{ActiveListCoordinator, ActiveSelection, ChatDirectory, ContextConsumer};
