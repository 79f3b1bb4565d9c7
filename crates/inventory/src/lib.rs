//! `lifelink-inventory` — the per-hospital stock aggregate.
//!
//! One stream per hospital holds both the physical batch ledger and the
//! per-group level counters, so a reservation (level check, decrement, FIFO
//! batch draws) commits as a single conditional append.

pub mod status;
pub mod stock;

pub use status::{StockStatus, StockThresholds};
pub use stock::{
    AdjustLevel, Batch, BatchAction, BatchDraw, BatchId, BatchReceived, BatchSource, BatchStatus,
    HospitalStock, ReapExpired, ReceiveBatch, ReleaseReservation, ReserveStock, SettleReservation,
    StockCommand, StockEvent, StockId, UseBatchUnits, AGGREGATE_TYPE, DEFAULT_SHELF_LIFE_DAYS,
};
