//! Binaries and wiring for the broker transit-latency probe.
pub mod app;
pub mod config;
pub mod observability;
