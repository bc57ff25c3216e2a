pub mod metrics;
pub mod process;
pub mod stage;
pub mod storage;
pub mod workspace;
