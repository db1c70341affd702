//! JSON serialization glue shared by persistence and cache payloads.

/// Uniform JSON string round-trip for serde types, parameterized by the
/// caller's error type so each subsystem keeps its own diagnostics.
pub trait JsonSerializable<E>: Sized {
    fn to_json_string(&self) -> Result<String, E>;
    fn from_json_str(s: &str) -> Result<Self, E>;
}
