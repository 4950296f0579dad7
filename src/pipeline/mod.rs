pub mod candidate;
pub mod orchestrator;
pub mod pool;
pub mod summary;
