//! Constructors for the crate's standard map types.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Construct an empty extra-data map with the crate's standard hasher.
pub fn new_extra_map() -> FxHashMap<String, Value> {
    FxHashMap::default()
}

/// Build an extra-data map from an iterator of entries.
pub fn extra_map_from<I>(entries: I) -> FxHashMap<String, Value>
where
    I: IntoIterator<Item = (String, Value)>,
{
    entries.into_iter().collect()
}
