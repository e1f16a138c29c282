//! Persistence for netmesh: the user roster and the message audit log.
//!
//! Backed by SQLite. The server treats both stores as plain CRUD
//! collaborators; nothing in here knows about connections or crypto.

mod database;
mod error;
mod messages;
mod users;

pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::MessageStore;
pub use users::UserStore;
