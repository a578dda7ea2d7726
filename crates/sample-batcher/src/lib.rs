//! Sample Batcher
//!
//! Accumulates named variable samples and turns them into a single Batch
//! frame once enough samples arrived or enough time passed since the last
//! flush.

mod batch;

pub use batch::{BatchConfig, BatchEntry, VariableBatch};
