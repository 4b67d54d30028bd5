pub mod app;
pub mod bundle;
pub mod config;
pub mod delay;
pub mod error;
pub mod events;
pub mod integrity;
pub mod lifecycle;
pub mod observability;
pub mod store;
pub mod telemetry;
pub mod update_check;
pub mod watchdog;
