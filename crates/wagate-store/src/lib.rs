pub mod database;
pub mod error;
pub mod instances;
pub mod row_helpers;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use instances::{InstanceConfigUpdate, InstanceRecord, InstanceRepo, NewInstance};
