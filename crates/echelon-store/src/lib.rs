pub mod database;
pub mod error;
pub mod events;
pub mod hierarchies;
pub mod row_helpers;
pub mod runs;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
