pub mod export;
pub mod loader;
pub mod manager;
pub mod wal;

pub use export::{ArtifactDescription, ArtifactManager, HeatIndex, HeatIndexEntry};
pub use loader::SnapshotRecord;
pub use manager::DatasetManager;
pub use wal::CongestionLog;
