//! `lifelink-observability` — process-wide logging/tracing setup.

pub mod tracing;
