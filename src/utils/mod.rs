//! Small shared helpers: collection constructors, id generation, JSON glue.

pub mod collections;
pub mod ids;
pub mod json_ext;
