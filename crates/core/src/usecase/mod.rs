pub mod cancellation;
pub mod execution_registry;
pub mod executor;
pub mod job_service;
pub mod reaper;
pub mod status_recorder;
