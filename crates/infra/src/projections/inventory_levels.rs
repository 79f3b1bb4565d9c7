use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use serde_json::Value as JsonValue;
use thiserror::Error;

use lifelink_core::{ActorId, AggregateId, BloodGroup};
use lifelink_events::EventEnvelope;
use lifelink_inventory::{StockEvent, StockStatus, StockThresholds};

use crate::read_model::ReadStore;

/// Cached per-hospital level counters: the O(1) availability figure.
///
/// The batch ledger inside the stock stream stays the audit source of
/// truth; this read model only mirrors the counter movements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelsReadModel {
    pub hospital: AggregateId,
    pub levels: BTreeMap<BloodGroup, i64>,
}

/// One row of an inventory dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLevel {
    pub group: BloodGroup,
    pub units: u32,
    pub status: StockStatus,
}

/// Classify raw counters into the eight dashboard rows, clamping the
/// tolerated negative drift to zero for display.
pub fn classify_levels(
    levels: &BTreeMap<BloodGroup, i64>,
    thresholds: &StockThresholds,
) -> Vec<GroupLevel> {
    BloodGroup::ALL
        .into_iter()
        .map(|group| {
            let raw = levels.get(&group).copied().unwrap_or(0);
            GroupLevel {
                group,
                units: raw.max(0) as u32,
                status: thresholds.classify(raw),
            }
        })
        .collect()
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize event: {0}")]
    Deserialize(String),

    #[error("envelope does not belong to the stream: {0}")]
    StreamMismatch(String),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Inventory levels projection.
///
/// Consumes published envelopes (JSON payloads) and maintains the cached
/// counters. Idempotent under at-least-once delivery: replays at or below
/// the per-stream cursor are ignored.
#[derive(Debug)]
pub struct InventoryLevelsProjection<S>
where
    S: ReadStore<AggregateId, LevelsReadModel>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> InventoryLevelsProjection<S>
where
    S: ReadStore<AggregateId, LevelsReadModel>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    /// Raw counters for one hospital.
    pub fn get(&self, hospital: ActorId) -> Option<LevelsReadModel> {
        self.store.get(&hospital.as_aggregate())
    }

    /// Dashboard view for one hospital (all eight groups, classified).
    pub fn snapshot(&self, hospital: ActorId, thresholds: &StockThresholds) -> Vec<GroupLevel> {
        let levels = self
            .get(hospital)
            .map(|rm| rm.levels)
            .unwrap_or_default();
        classify_levels(&levels, thresholds)
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != lifelink_inventory::AGGREGATE_TYPE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let Ok(mut cursors) = self.cursors.write() else {
            return Ok(());
        };
        let last = *cursors.get(&aggregate_id).unwrap_or(&0);

        if seq == 0 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }
        if seq <= last {
            // Duplicate or replay; safe to ignore.
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: StockEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        let event_stream = match &event {
            StockEvent::BatchReceived(e) => e.stock_id,
            StockEvent::StockReserved(e) => e.stock_id,
            StockEvent::ReservationReleased(e) => e.stock_id,
            StockEvent::ReservationSettled(e) => e.stock_id,
            StockEvent::BatchUnitsUsed(e) => e.stock_id,
            StockEvent::LevelAdjusted(e) => e.stock_id,
            StockEvent::BatchExpired(e) => e.stock_id,
        };
        if event_stream.0 != aggregate_id {
            return Err(ProjectionError::StreamMismatch(
                "event stock_id does not match envelope aggregate_id".to_string(),
            ));
        }

        let mut rm = self.store.get(&aggregate_id).unwrap_or(LevelsReadModel {
            hospital: aggregate_id,
            levels: BTreeMap::new(),
        });

        let mut bump = |group: BloodGroup, delta: i64| {
            *rm.levels.entry(group).or_insert(0) += delta;
        };

        match &event {
            StockEvent::BatchReceived(e) => bump(e.blood_group, i64::from(e.units)),
            StockEvent::StockReserved(e) => bump(e.blood_group, -i64::from(e.units)),
            StockEvent::ReservationReleased(e) => bump(e.blood_group, i64::from(e.units)),
            StockEvent::ReservationSettled(_) => {}
            StockEvent::BatchUnitsUsed(e) => bump(e.blood_group, -i64::from(e.quantity)),
            StockEvent::LevelAdjusted(e) => bump(e.blood_group, e.delta),
            StockEvent::BatchExpired(e) => bump(e.blood_group, -i64::from(e.reclaimed)),
        }

        self.store.upsert(aggregate_id, rm);

        // Advance cursor after successful apply.
        cursors.insert(aggregate_id, seq);

        Ok(())
    }

    /// Rebuild the read model from scratch by replaying envelopes.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), ProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        // Deterministic replay order: aggregate, then sequence.
        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (*e.aggregate_id().as_uuid().as_bytes(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }

        Ok(())
    }
}
