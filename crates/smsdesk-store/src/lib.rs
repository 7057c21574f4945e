//! SQLite-backed persistence for users, phone numbers, contacts and messages.

pub mod error;
mod schema;
mod store;

pub use error::{Result, StoreError};
pub use store::{MessageStore, NewMessage, NewPhoneNumber, RecordedMessage};
