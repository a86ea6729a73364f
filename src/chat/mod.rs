//! Room chat: persisted messages broadcast to room members.
//!
//! ## Storage
//!
//! Messages live in SQLite behind the `ChatStore` trait. A message is only
//! ever broadcast after the store has accepted the write, so members never
//! see a message that was not persisted.

pub mod broadcast;
pub mod store;

pub use store::{ChatStore, SqliteChatStore};
