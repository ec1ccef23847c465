pub mod sqlite;

pub use sqlite::{validate_collection_name, SqliteCollectionStore, StoreSettings};
