//! `reveil-core` — alarm definition, process configuration and the
//! transactional alarm store shared by the scheduler and the HTTP gateway.

pub mod alarm;
pub mod config;
pub mod db;
pub mod error;
pub mod store;

pub use alarm::{AlarmDefinition, TimeOfDay};
pub use error::{CoreError, Result};
pub use store::AlarmStore;
