//! Inbound notifications supplied by the store after a write or a deletion

pub mod models;

pub use models::{
    AttributeDescriptor, AttributeId, ChangeEntry, ChangeNotification, DataValue,
    DeleteNotification, RecordId, TableDiff, normalize_key,
};
