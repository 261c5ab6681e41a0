//! SQLite adapters for the `rtb-core` ports.
//!
//! One `tokio-rusqlite` connection serves every repository, the bus and the
//! dead-letter store.

pub mod bus;
pub mod database;
pub mod dead_letters;
pub mod payments;
pub mod requests;
pub mod statuses;
pub mod users;

use std::sync::Arc;

pub use bus::{SqliteBus, SqliteConsumer};
pub use database::Database;
pub use dead_letters::SqliteDeadLetters;
pub use payments::SqlitePayments;
pub use requests::SqliteRequests;
pub use statuses::SqliteStatuses;
pub use users::SqliteUsers;

/// Every repository over one shared database.
#[derive(Clone)]
pub struct Store {
    pub db: Database,
    pub requests: Arc<SqliteRequests>,
    pub statuses: Arc<SqliteStatuses>,
    pub users: Arc<SqliteUsers>,
    pub payments: Arc<SqlitePayments>,
    pub dead_letters: Arc<SqliteDeadLetters>,
}

impl Store {
    pub fn new(db: Database) -> Self {
        Self {
            requests: Arc::new(SqliteRequests::new(db.clone())),
            statuses: Arc::new(SqliteStatuses::new(db.clone())),
            users: Arc::new(SqliteUsers::new(db.clone())),
            payments: Arc::new(SqlitePayments::new(db.clone())),
            dead_letters: Arc::new(SqliteDeadLetters::new(db.clone())),
            db,
        }
    }

    pub fn bus(&self) -> SqliteBus {
        SqliteBus::new(self.db.clone())
    }
}
