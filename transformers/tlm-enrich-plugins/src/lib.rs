//! Built-in enrichment plugins.

mod add_fields;
mod add_timestamp;
mod lookup;
mod remove_fields;
mod rename_fields;

pub use add_fields::AddFields;
pub use add_timestamp::{AddTimestamp, TimeSource, TimestampFormat};
pub use lookup::Lookup;
pub use remove_fields::RemoveFields;
pub use rename_fields::RenameFields;
