//! Port traits between the domain and its adapters.

pub mod cohort_port;
pub mod config_port;
pub mod data_port;
pub mod store_port;
