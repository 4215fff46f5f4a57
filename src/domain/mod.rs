//! Core domain types and logic.

pub mod breadth;
pub mod cohort;
pub mod config_validation;
pub mod error;
pub mod events;
pub mod history;
pub mod indicator;
pub mod materializer;
pub mod ohlcv;
pub mod ranking;
pub mod returns;
pub mod screening;
pub mod snapshot;
pub mod strength;
pub mod trigger;
pub mod trigger_parser;
