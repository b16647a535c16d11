pub mod engine;
pub mod postgres;
pub mod store;

pub use engine::SyncEngine;
pub use store::MemoryDocumentStore;
