//! Per-document namespaces and their durable storage.

mod store;
mod types;

pub use store::{NAMESPACE_EXT, NamespaceStore, load_from, persist_at};
pub use types::{
    FORMAT_VERSION, Namespace, NamespaceDelta, decode_value, decode_variables, encode_value,
    encode_variables,
};
