//! Disposable read models maintained from published event envelopes.

pub mod inventory_levels;
pub mod request_feed;
