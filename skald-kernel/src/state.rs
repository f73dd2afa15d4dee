use parking_lot::RwLock;
use std::sync::Arc;

/// Single-writer, multi-reader state shared between daemon tasks
pub type Shared<T> = Arc<RwLock<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(RwLock::new(value))
}
