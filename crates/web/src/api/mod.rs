//! REST API endpoint modules.

pub mod config;
pub mod schema;
pub mod status;
pub mod update;
pub mod values;
