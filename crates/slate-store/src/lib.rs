pub mod database;
pub mod error;
pub mod jobs;
pub mod ledger;
pub mod projects;
pub mod proposals;
pub mod row_helpers;
pub mod scenes;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
