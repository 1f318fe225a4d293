//! USB benchmark
//!
//! Drives a benchmark firmware's read, write and loop tests through the
//! `xfer` transfer engine and reports throughput while the test runs.

pub mod config;
pub mod device;
pub mod display;
pub mod firmware;
pub mod pipeline;
pub mod runner;
pub mod stats;
pub mod verify;
pub mod worker;
