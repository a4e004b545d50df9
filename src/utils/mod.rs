/// Error types shared by the stores and the engine.
pub mod error;
/// Per-key async locks.
pub mod lock;
