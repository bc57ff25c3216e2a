pub mod error;
pub mod job;
pub mod settings;
pub mod stage;
pub mod timing;

mod serde_tests;
