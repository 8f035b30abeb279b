//! Datasource metadata: tagged values, identity schema and the inverted index

mod index;
mod schema;
mod value;

pub use index::MetadataIndex;
pub use schema::{DataKind, Fingerprint, DATA_TYPE_KEY};
pub use value::{FilterValue, Filters, Metadata, MetadataValue};
