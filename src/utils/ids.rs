//! Identifier generation for threads and auxiliary checkpoint writes.

use uuid::Uuid;

/// Generates unique, prefixed identifiers.
#[derive(Clone, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Thread id for a conversation that arrived without one.
    pub fn generate_thread_id(&self) -> String {
        format!("thread-{}", Uuid::new_v4())
    }

    /// Task id for an auxiliary checkpoint write.
    pub fn generate_task_id(&self) -> String {
        format!("task-{}", Uuid::new_v4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_prefixed_and_unique() {
        let ids = IdGenerator::new();
        let a = ids.generate_thread_id();
        let b = ids.generate_thread_id();
        assert!(a.starts_with("thread-"));
        assert_ne!(a, b);
    }
}
