//! `lifelink-infra` — infrastructure and application wiring.
//!
//! Event store (append-only, optimistic CAS), command dispatcher,
//! read-model projections, the external collaborator seams (actor
//! directory, notification sink) and the `BloodBank` coordinator that
//! exposes the transport-independent operation set.

pub mod command_dispatcher;
pub mod coordinator;
pub mod directory;
pub mod event_store;
pub mod notify;
pub mod projections;
pub mod read_model;

pub use coordinator::{BloodBank, NewBatch, NewRequest};
