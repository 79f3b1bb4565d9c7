use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use lifelink_core::{Aggregate, AggregateId, AggregateRoot, BloodGroup, DomainError};
use lifelink_events::Event;

/// Stream type identifier for hospital stock aggregates.
pub const AGGREGATE_TYPE: &str = "inventory.hospital_stock";

/// Shelf life applied to batches created from completed requests and
/// appointments (whole blood).
pub const DEFAULT_SHELF_LIFE_DAYS: i64 = 35;

/// Hospital stock stream identifier (the hospital's own actor uuid).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StockId(pub AggregateId);

impl StockId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for StockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Identifier of one batch within a hospital's ledger.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for BatchId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Where a batch came from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchSource {
    Donation,
    Transfer,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Active,
    Depleted,
    Expired,
}

/// Explicit staff action on a single batch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Use,
    Discard,
}

/// One physical lot of blood: a single collection/transfer event with its
/// own expiry. Units only ever decrease after creation; corrections happen
/// by receiving a new batch. Batches are kept after depletion and expiry
/// for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub collected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: BatchSource,
    pub source_name: String,
    pub status: BatchStatus,
}

/// Units taken from (or restored to) one batch during FIFO consumption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDraw {
    pub batch_id: BatchId,
    pub units: u32,
}

/// An outstanding Accept-time reservation, keyed by the request that made it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Reservation {
    blood_group: BloodGroup,
    units: u32,
    draws: Vec<BatchDraw>,
}

/// Aggregate root: HospitalStock.
///
/// `levels` is the per-group counter the rest of the system reads and
/// reserves against; `batches` is the physical ledger it must add up to.
/// Manual level overrides are the one tolerated drift source — they adjust
/// the counter without touching batches, and reads clamp negatives to zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HospitalStock {
    id: StockId,
    levels: BTreeMap<BloodGroup, i64>,
    batches: Vec<Batch>,
    reservations: BTreeMap<Uuid, Reservation>,
    version: u64,
}

impl HospitalStock {
    /// Stock streams have upsert semantics: an empty aggregate is a valid
    /// hospital with nothing on the shelves, so there is no creation step.
    pub fn empty(id: StockId) -> Self {
        Self {
            id,
            levels: BTreeMap::new(),
            batches: Vec::new(),
            reservations: BTreeMap::new(),
            version: 0,
        }
    }

    pub fn id_typed(&self) -> StockId {
        self.id
    }

    /// Raw level counter for a group (may be negative after overrides).
    pub fn level(&self, group: BloodGroup) -> i64 {
        self.levels.get(&group).copied().unwrap_or(0)
    }

    pub fn levels(&self) -> &BTreeMap<BloodGroup, i64> {
        &self.levels
    }

    /// Level clamped for display.
    pub fn display_level(&self, group: BloodGroup) -> u32 {
        self.level(group).max(0) as u32
    }

    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    pub fn batch(&self, id: BatchId) -> Option<&Batch> {
        self.batches.iter().find(|b| b.id == id)
    }

    pub fn has_reservation(&self, reservation_id: Uuid) -> bool {
        self.reservations.contains_key(&reservation_id)
    }

    /// Sum of remaining units across active batches of a group — the audit
    /// truth the level counter is supposed to track.
    pub fn active_batch_units(&self, group: BloodGroup) -> i64 {
        self.batches
            .iter()
            .filter(|b| b.blood_group == group && b.status == BatchStatus::Active)
            .map(|b| i64::from(b.units))
            .sum()
    }

    /// Plan FIFO consumption: oldest collection date first, over batches
    /// that still hold units. Returns the draws and the unmet remainder.
    fn plan_fifo(&self, group: BloodGroup, needed: u32) -> (Vec<BatchDraw>, u32) {
        let mut order: Vec<&Batch> = self
            .batches
            .iter()
            .filter(|b| b.blood_group == group && b.status == BatchStatus::Active && b.units > 0)
            .collect();
        order.sort_by_key(|b| b.collected_at);

        let mut remaining = needed;
        let mut draws = Vec::new();
        for batch in order {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(batch.units);
            draws.push(BatchDraw {
                batch_id: batch.id,
                units: take,
            });
            remaining -= take;
        }
        (draws, remaining)
    }

    fn batch_mut(&mut self, id: BatchId) -> Option<&mut Batch> {
        self.batches.iter_mut().find(|b| b.id == id)
    }

    fn add_level(&mut self, group: BloodGroup, delta: i64) {
        *self.levels.entry(group).or_insert(0) += delta;
    }
}

impl AggregateRoot for HospitalStock {
    type Id = StockId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: ReceiveBatch (any stock-increasing event: donation intake,
/// transfer receipt, manual entry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiveBatch {
    pub stock_id: StockId,
    pub batch_id: BatchId,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub collected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: BatchSource,
    pub source_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReserveStock (Accept-time check-and-decrement + FIFO draws).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub stock_id: StockId,
    /// The request this reservation backs; re-reserving the same key is an
    /// idempotent no-op.
    pub reservation_id: Uuid,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReleaseReservation (cancel-time refund, symmetric with reserve).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseReservation {
    pub stock_id: StockId,
    pub reservation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SettleReservation (completion makes the consumption permanent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleReservation {
    pub stock_id: StockId,
    pub reservation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

/// Command: UseBatchUnits (explicit staff deduction, bypasses FIFO).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UseBatchUnits {
    pub stock_id: StockId,
    pub batch_id: BatchId,
    pub quantity: u32,
    pub action: BatchAction,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AdjustLevel (manual override of the counter; the tolerated
/// drift source).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustLevel {
    pub stock_id: StockId,
    pub blood_group: BloodGroup,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReapExpired (opportunistic, idempotent retirement of batches
/// past their expiry).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapExpired {
    pub stock_id: StockId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    ReceiveBatch(ReceiveBatch),
    ReserveStock(ReserveStock),
    ReleaseReservation(ReleaseReservation),
    SettleReservation(SettleReservation),
    UseBatchUnits(UseBatchUnits),
    AdjustLevel(AdjustLevel),
    ReapExpired(ReapExpired),
}

/// Event: BatchReceived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReceived {
    pub stock_id: StockId,
    pub batch_id: BatchId,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub collected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub source: BatchSource,
    pub source_name: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: StockReserved.
///
/// `shortfall` is the portion the level check admitted but the batch ledger
/// could not supply — a sign the counter and the shelves have drifted. It
/// is reported for logging, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReserved {
    pub stock_id: StockId,
    pub reservation_id: Uuid,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub draws: Vec<BatchDraw>,
    pub shortfall: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationReleased.
///
/// `restored` lists the draws put back on the shelves; `unrestored` counts
/// units whose batch expired while the reservation was outstanding (the
/// level is still refunded in full — symmetric with the reserve).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReleased {
    pub stock_id: StockId,
    pub reservation_id: Uuid,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub restored: Vec<BatchDraw>,
    pub unrestored: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReservationSettled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSettled {
    pub stock_id: StockId,
    pub reservation_id: Uuid,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchUnitsUsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUnitsUsed {
    pub stock_id: StockId,
    pub batch_id: BatchId,
    pub blood_group: BloodGroup,
    pub quantity: u32,
    pub action: BatchAction,
    pub remaining: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Event: LevelAdjusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelAdjusted {
    pub stock_id: StockId,
    pub blood_group: BloodGroup,
    pub delta: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BatchExpired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchExpired {
    pub stock_id: StockId,
    pub batch_id: BatchId,
    pub blood_group: BloodGroup,
    pub reclaimed: u32,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    BatchReceived(BatchReceived),
    StockReserved(StockReserved),
    ReservationReleased(ReservationReleased),
    ReservationSettled(ReservationSettled),
    BatchUnitsUsed(BatchUnitsUsed),
    LevelAdjusted(LevelAdjusted),
    BatchExpired(BatchExpired),
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::BatchReceived(_) => "inventory.batch_received",
            StockEvent::StockReserved(_) => "inventory.stock_reserved",
            StockEvent::ReservationReleased(_) => "inventory.reservation_released",
            StockEvent::ReservationSettled(_) => "inventory.reservation_settled",
            StockEvent::BatchUnitsUsed(_) => "inventory.batch_units_used",
            StockEvent::LevelAdjusted(_) => "inventory.level_adjusted",
            StockEvent::BatchExpired(_) => "inventory.batch_expired",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::BatchReceived(e) => e.occurred_at,
            StockEvent::StockReserved(e) => e.occurred_at,
            StockEvent::ReservationReleased(e) => e.occurred_at,
            StockEvent::ReservationSettled(e) => e.occurred_at,
            StockEvent::BatchUnitsUsed(e) => e.occurred_at,
            StockEvent::LevelAdjusted(e) => e.occurred_at,
            StockEvent::BatchExpired(e) => e.occurred_at,
        }
    }
}

impl Aggregate for HospitalStock {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::BatchReceived(e) => {
                self.batches.push(Batch {
                    id: e.batch_id,
                    blood_group: e.blood_group,
                    units: e.units,
                    collected_at: e.collected_at,
                    expires_at: e.expires_at,
                    source: e.source,
                    source_name: e.source_name.clone(),
                    status: BatchStatus::Active,
                });
                self.add_level(e.blood_group, i64::from(e.units));
            }
            StockEvent::StockReserved(e) => {
                self.add_level(e.blood_group, -i64::from(e.units));
                for draw in &e.draws {
                    if let Some(batch) = self.batch_mut(draw.batch_id) {
                        batch.units = batch.units.saturating_sub(draw.units);
                        if batch.units == 0 {
                            batch.status = BatchStatus::Depleted;
                        }
                    }
                }
                self.reservations.insert(
                    e.reservation_id,
                    Reservation {
                        blood_group: e.blood_group,
                        units: e.units,
                        draws: e.draws.clone(),
                    },
                );
            }
            StockEvent::ReservationReleased(e) => {
                self.add_level(e.blood_group, i64::from(e.units));
                for draw in &e.restored {
                    if let Some(batch) = self.batch_mut(draw.batch_id) {
                        batch.units += draw.units;
                        if batch.status == BatchStatus::Depleted {
                            batch.status = BatchStatus::Active;
                        }
                    }
                }
                self.reservations.remove(&e.reservation_id);
            }
            StockEvent::ReservationSettled(e) => {
                self.reservations.remove(&e.reservation_id);
            }
            StockEvent::BatchUnitsUsed(e) => {
                if let Some(batch) = self.batch_mut(e.batch_id) {
                    batch.units = batch.units.saturating_sub(e.quantity);
                    if batch.units == 0 {
                        batch.status = BatchStatus::Depleted;
                    }
                }
                self.add_level(e.blood_group, -i64::from(e.quantity));
            }
            StockEvent::LevelAdjusted(e) => {
                self.add_level(e.blood_group, e.delta);
            }
            StockEvent::BatchExpired(e) => {
                if let Some(batch) = self.batch_mut(e.batch_id) {
                    batch.units = 0;
                    batch.status = BatchStatus::Expired;
                }
                self.add_level(e.blood_group, -i64::from(e.reclaimed));
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::ReceiveBatch(cmd) => self.handle_receive(cmd),
            StockCommand::ReserveStock(cmd) => self.handle_reserve(cmd),
            StockCommand::ReleaseReservation(cmd) => self.handle_release(cmd),
            StockCommand::SettleReservation(cmd) => self.handle_settle(cmd),
            StockCommand::UseBatchUnits(cmd) => self.handle_use(cmd),
            StockCommand::AdjustLevel(cmd) => self.handle_adjust(cmd),
            StockCommand::ReapExpired(cmd) => self.handle_reap(cmd),
        }
    }
}

impl HospitalStock {
    fn ensure_stock_id(&self, stock_id: StockId) -> Result<(), DomainError> {
        if self.id != stock_id {
            return Err(DomainError::conflict("stock_id mismatch"));
        }
        Ok(())
    }

    fn handle_receive(&self, cmd: &ReceiveBatch) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        if cmd.units == 0 {
            return Err(DomainError::validation("units must be greater than 0"));
        }
        if cmd.expires_at <= cmd.collected_at {
            return Err(DomainError::validation(
                "expiry must be after the collection date",
            ));
        }
        if self.batch(cmd.batch_id).is_some() {
            return Err(DomainError::conflict("batch already exists"));
        }

        Ok(vec![StockEvent::BatchReceived(BatchReceived {
            stock_id: cmd.stock_id,
            batch_id: cmd.batch_id,
            blood_group: cmd.blood_group,
            units: cmd.units,
            collected_at: cmd.collected_at,
            expires_at: cmd.expires_at,
            source: cmd.source,
            source_name: cmd.source_name.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reserve(&self, cmd: &ReserveStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        if cmd.units == 0 {
            return Err(DomainError::validation("units must be greater than 0"));
        }
        // The same request re-reserving is an idempotent success.
        if self.has_reservation(cmd.reservation_id) {
            return Ok(vec![]);
        }

        let available = self.level(cmd.blood_group);
        if available < i64::from(cmd.units) {
            return Err(DomainError::insufficient_stock(available, cmd.units));
        }

        let (draws, shortfall) = self.plan_fifo(cmd.blood_group, cmd.units);

        Ok(vec![StockEvent::StockReserved(StockReserved {
            stock_id: cmd.stock_id,
            reservation_id: cmd.reservation_id,
            blood_group: cmd.blood_group,
            units: cmd.units,
            draws,
            shortfall,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseReservation) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        // Unknown key: either never reserved (broadcast cancel) or already
        // released. Both are safe no-ops.
        let Some(reservation) = self.reservations.get(&cmd.reservation_id) else {
            return Ok(vec![]);
        };

        // Units drawn from a batch that expired in the meantime stay off the
        // shelves; the level is still refunded in full.
        let mut restored = Vec::new();
        let mut unrestored = 0u32;
        for draw in &reservation.draws {
            match self.batch(draw.batch_id) {
                Some(batch) if batch.status != BatchStatus::Expired => {
                    restored.push(draw.clone());
                }
                _ => unrestored += draw.units,
            }
        }

        Ok(vec![StockEvent::ReservationReleased(ReservationReleased {
            stock_id: cmd.stock_id,
            reservation_id: cmd.reservation_id,
            blood_group: reservation.blood_group,
            units: reservation.units,
            restored,
            unrestored,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_settle(&self, cmd: &SettleReservation) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        if !self.has_reservation(cmd.reservation_id) {
            return Ok(vec![]);
        }

        Ok(vec![StockEvent::ReservationSettled(ReservationSettled {
            stock_id: cmd.stock_id,
            reservation_id: cmd.reservation_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_use(&self, cmd: &UseBatchUnits) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        if cmd.quantity == 0 {
            return Err(DomainError::validation("quantity must be greater than 0"));
        }
        let batch = self.batch(cmd.batch_id).ok_or_else(DomainError::not_found)?;
        if batch.units < cmd.quantity {
            return Err(DomainError::insufficient_stock(
                i64::from(batch.units),
                cmd.quantity,
            ));
        }

        Ok(vec![StockEvent::BatchUnitsUsed(BatchUnitsUsed {
            stock_id: cmd.stock_id,
            batch_id: cmd.batch_id,
            blood_group: batch.blood_group,
            quantity: cmd.quantity,
            action: cmd.action,
            remaining: batch.units - cmd.quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_adjust(&self, cmd: &AdjustLevel) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        if cmd.delta == 0 {
            return Err(DomainError::validation("delta cannot be zero"));
        }

        Ok(vec![StockEvent::LevelAdjusted(LevelAdjusted {
            stock_id: cmd.stock_id,
            blood_group: cmd.blood_group,
            delta: cmd.delta,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reap(&self, cmd: &ReapExpired) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_stock_id(cmd.stock_id)?;

        // Re-running over already-expired batches emits nothing.
        let events: Vec<StockEvent> = self
            .batches
            .iter()
            .filter(|b| {
                b.status == BatchStatus::Active && b.units > 0 && b.expires_at < cmd.occurred_at
            })
            .map(|b| {
                StockEvent::BatchExpired(BatchExpired {
                    stock_id: cmd.stock_id,
                    batch_id: b.id,
                    blood_group: b.blood_group,
                    reclaimed: b.units,
                    occurred_at: cmd.occurred_at,
                })
            })
            .collect();

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_stock_id() -> StockId {
        StockId::new(AggregateId::new())
    }

    fn drawn_total(draws: &[BatchDraw]) -> u32 {
        draws.iter().map(|d| d.units).sum()
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn apply_all(stock: &mut HospitalStock, events: &[StockEvent]) {
        for event in events {
            stock.apply(event);
        }
    }

    fn receive(
        stock: &mut HospitalStock,
        group: BloodGroup,
        units: u32,
        collected_at: DateTime<Utc>,
    ) -> BatchId {
        let batch_id = BatchId::new();
        let events = stock
            .handle(&StockCommand::ReceiveBatch(ReceiveBatch {
                stock_id: stock.id_typed(),
                batch_id,
                blood_group: group,
                units,
                collected_at,
                expires_at: collected_at + Duration::days(DEFAULT_SHELF_LIFE_DAYS),
                source: BatchSource::Donation,
                source_name: "Walk-in Donor".to_string(),
                occurred_at: collected_at,
            }))
            .unwrap();
        apply_all(stock, &events);
        batch_id
    }

    fn reserve(
        stock: &mut HospitalStock,
        group: BloodGroup,
        units: u32,
    ) -> Result<Uuid, DomainError> {
        let reservation_id = Uuid::now_v7();
        let events = stock.handle(&StockCommand::ReserveStock(ReserveStock {
            stock_id: stock.id_typed(),
            reservation_id,
            blood_group: group,
            units,
            occurred_at: test_time() + Duration::hours(1),
        }))?;
        apply_all(stock, &events);
        Ok(reservation_id)
    }

    #[test]
    fn receiving_a_batch_raises_the_level() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::OPos, 5, test_time());
        assert_eq!(stock.level(BloodGroup::OPos), 5);
        assert_eq!(stock.active_batch_units(BloodGroup::OPos), 5);
        assert_eq!(stock.level(BloodGroup::ANeg), 0);
    }

    #[test]
    fn fifo_consumes_the_oldest_batch_first() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let b1 = receive(&mut stock, BloodGroup::APos, 5, test_time());
        let b2 = receive(&mut stock, BloodGroup::APos, 5, test_time() + Duration::days(2));

        reserve(&mut stock, BloodGroup::APos, 7).unwrap();

        let first = stock.batch(b1).unwrap();
        let second = stock.batch(b2).unwrap();
        assert_eq!(first.units, 0);
        assert_eq!(first.status, BatchStatus::Depleted);
        assert_eq!(second.units, 3);
        assert_eq!(second.status, BatchStatus::Active);
        assert_eq!(stock.level(BloodGroup::APos), 3);
    }

    #[test]
    fn fifo_ignores_batches_of_other_groups() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let other = receive(&mut stock, BloodGroup::BNeg, 4, test_time());
        receive(&mut stock, BloodGroup::APos, 4, test_time() + Duration::days(1));

        reserve(&mut stock, BloodGroup::APos, 2).unwrap();

        assert_eq!(stock.batch(other).unwrap().units, 4);
        assert_eq!(stock.level(BloodGroup::BNeg), 4);
        assert_eq!(stock.level(BloodGroup::APos), 2);
    }

    #[test]
    fn reserve_rejects_insufficient_stock_without_mutation() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::ONeg, 1, test_time());

        let err = reserve(&mut stock, BloodGroup::ONeg, 2).unwrap_err();
        assert_eq!(
            err,
            DomainError::InsufficientStock {
                available: 1,
                requested: 2
            }
        );
        assert_eq!(stock.level(BloodGroup::ONeg), 1);
    }

    #[test]
    fn re_reserving_the_same_request_is_a_no_op() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::OPos, 4, test_time());

        let reservation_id = Uuid::now_v7();
        let cmd = StockCommand::ReserveStock(ReserveStock {
            stock_id: stock.id_typed(),
            reservation_id,
            blood_group: BloodGroup::OPos,
            units: 2,
            occurred_at: test_time() + Duration::hours(1),
        });
        let events = stock.handle(&cmd).unwrap();
        apply_all(&mut stock, &events);
        assert_eq!(stock.level(BloodGroup::OPos), 2);

        let retried = stock.handle(&cmd).unwrap();
        assert!(retried.is_empty());
        assert_eq!(stock.level(BloodGroup::OPos), 2);
    }

    #[test]
    fn release_restores_level_and_batches_exactly() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let b1 = receive(&mut stock, BloodGroup::APos, 5, test_time());
        let before = stock.clone();

        let reservation_id = reserve(&mut stock, BloodGroup::APos, 5).unwrap();
        assert_eq!(stock.level(BloodGroup::APos), 0);
        assert_eq!(stock.batch(b1).unwrap().status, BatchStatus::Depleted);

        let events = stock
            .handle(&StockCommand::ReleaseReservation(ReleaseReservation {
                stock_id: stock.id_typed(),
                reservation_id,
                occurred_at: test_time() + Duration::hours(2),
            }))
            .unwrap();
        apply_all(&mut stock, &events);

        assert_eq!(stock.level(BloodGroup::APos), before.level(BloodGroup::APos));
        assert_eq!(stock.batch(b1).unwrap().units, 5);
        assert_eq!(stock.batch(b1).unwrap().status, BatchStatus::Active);
        assert!(!stock.has_reservation(reservation_id));
    }

    #[test]
    fn releasing_an_unknown_reservation_is_a_no_op() {
        let stock = HospitalStock::empty(test_stock_id());
        let events = stock
            .handle(&StockCommand::ReleaseReservation(ReleaseReservation {
                stock_id: stock.id_typed(),
                reservation_id: Uuid::now_v7(),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn settling_makes_the_consumption_permanent() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::OPos, 3, test_time());
        let reservation_id = reserve(&mut stock, BloodGroup::OPos, 2).unwrap();

        let events = stock
            .handle(&StockCommand::SettleReservation(SettleReservation {
                stock_id: stock.id_typed(),
                reservation_id,
                occurred_at: test_time() + Duration::hours(3),
            }))
            .unwrap();
        apply_all(&mut stock, &events);

        assert_eq!(stock.level(BloodGroup::OPos), 1);
        assert!(!stock.has_reservation(reservation_id));

        // A release arriving after settlement must not refund anything.
        let late = stock
            .handle(&StockCommand::ReleaseReservation(ReleaseReservation {
                stock_id: stock.id_typed(),
                reservation_id,
                occurred_at: test_time() + Duration::hours(4),
            }))
            .unwrap();
        assert!(late.is_empty());
    }

    #[test]
    fn use_units_checks_ownership_of_sufficient_stock() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let batch_id = receive(&mut stock, BloodGroup::BPos, 3, test_time());

        let err = stock
            .handle(&StockCommand::UseBatchUnits(UseBatchUnits {
                stock_id: stock.id_typed(),
                batch_id,
                quantity: 4,
                action: BatchAction::Use,
                occurred_at: test_time() + Duration::hours(1),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock { .. }));

        let events = stock
            .handle(&StockCommand::UseBatchUnits(UseBatchUnits {
                stock_id: stock.id_typed(),
                batch_id,
                quantity: 3,
                action: BatchAction::Discard,
                occurred_at: test_time() + Duration::hours(1),
            }))
            .unwrap();
        match &events[0] {
            StockEvent::BatchUnitsUsed(e) => {
                assert_eq!(e.remaining, 0);
                assert_eq!(e.action, BatchAction::Discard);
            }
            _ => panic!("Expected BatchUnitsUsed event"),
        }
        apply_all(&mut stock, &events);
        assert_eq!(stock.batch(batch_id).unwrap().status, BatchStatus::Depleted);
        assert_eq!(stock.level(BloodGroup::BPos), 0);
    }

    #[test]
    fn use_units_on_an_unknown_batch_is_not_found() {
        let stock = HospitalStock::empty(test_stock_id());
        let err = stock
            .handle(&StockCommand::UseBatchUnits(UseBatchUnits {
                stock_id: stock.id_typed(),
                batch_id: BatchId::new(),
                quantity: 1,
                action: BatchAction::Use,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn reap_retires_overdue_batches_once() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let overdue = receive(&mut stock, BloodGroup::OPos, 4, test_time());
        let fresh = receive(&mut stock, BloodGroup::OPos, 2, test_time() + Duration::days(20));

        let now = test_time() + Duration::days(DEFAULT_SHELF_LIFE_DAYS + 1);
        let events = stock
            .handle(&StockCommand::ReapExpired(ReapExpired {
                stock_id: stock.id_typed(),
                occurred_at: now,
            }))
            .unwrap();
        assert_eq!(events.len(), 1);
        apply_all(&mut stock, &events);

        assert_eq!(stock.batch(overdue).unwrap().status, BatchStatus::Expired);
        assert_eq!(stock.batch(overdue).unwrap().units, 0);
        assert_eq!(stock.batch(fresh).unwrap().status, BatchStatus::Active);
        assert_eq!(stock.level(BloodGroup::OPos), 2);

        // Idempotent: a second sweep finds nothing.
        let again = stock
            .handle(&StockCommand::ReapExpired(ReapExpired {
                stock_id: stock.id_typed(),
                occurred_at: now,
            }))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn release_after_expiry_refunds_the_level_but_not_the_shelf() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let batch_id = receive(&mut stock, BloodGroup::ANeg, 3, test_time());
        let reservation_id = reserve(&mut stock, BloodGroup::ANeg, 2).unwrap();

        // The drawn batch expires while the reservation is outstanding.
        let now = test_time() + Duration::days(DEFAULT_SHELF_LIFE_DAYS + 1);
        let events = stock
            .handle(&StockCommand::ReapExpired(ReapExpired {
                stock_id: stock.id_typed(),
                occurred_at: now,
            }))
            .unwrap();
        apply_all(&mut stock, &events);

        let events = stock
            .handle(&StockCommand::ReleaseReservation(ReleaseReservation {
                stock_id: stock.id_typed(),
                reservation_id,
                occurred_at: now + Duration::hours(1),
            }))
            .unwrap();
        match &events[0] {
            StockEvent::ReservationReleased(e) => {
                assert_eq!(e.units, 2);
                assert!(e.restored.is_empty());
                assert_eq!(e.unrestored, 2);
            }
            _ => panic!("Expected ReservationReleased event"),
        }
        apply_all(&mut stock, &events);

        // Level refunded in full; the expired batch stays at zero.
        assert_eq!(stock.level(BloodGroup::ANeg), 2);
        assert_eq!(stock.batch(batch_id).unwrap().units, 0);
    }

    #[test]
    fn manual_overrides_may_drive_the_level_negative() {
        let mut stock = HospitalStock::empty(test_stock_id());
        let events = stock
            .handle(&StockCommand::AdjustLevel(AdjustLevel {
                stock_id: stock.id_typed(),
                blood_group: BloodGroup::AbNeg,
                delta: -2,
                occurred_at: test_time(),
            }))
            .unwrap();
        apply_all(&mut stock, &events);

        assert_eq!(stock.level(BloodGroup::AbNeg), -2);
        assert_eq!(stock.display_level(BloodGroup::AbNeg), 0);
    }

    #[test]
    fn zero_delta_is_rejected() {
        let stock = HospitalStock::empty(test_stock_id());
        let err = stock
            .handle(&StockCommand::AdjustLevel(AdjustLevel {
                stock_id: stock.id_typed(),
                blood_group: BloodGroup::AbNeg,
                delta: 0,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn reserve_shortfall_is_reported_not_thrown() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::OPos, 1, test_time());
        // Manual override inflates the counter past the shelves.
        let events = stock
            .handle(&StockCommand::AdjustLevel(AdjustLevel {
                stock_id: stock.id_typed(),
                blood_group: BloodGroup::OPos,
                delta: 2,
                occurred_at: test_time(),
            }))
            .unwrap();
        apply_all(&mut stock, &events);

        let events = stock
            .handle(&StockCommand::ReserveStock(ReserveStock {
                stock_id: stock.id_typed(),
                reservation_id: Uuid::now_v7(),
                blood_group: BloodGroup::OPos,
                units: 3,
                occurred_at: test_time() + Duration::hours(1),
            }))
            .unwrap();
        match &events[0] {
            StockEvent::StockReserved(e) => {
                assert_eq!(drawn_total(&e.draws), 1);
                assert_eq!(e.shortfall, 2);
            }
            _ => panic!("Expected StockReserved event"),
        }
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let mut stock = HospitalStock::empty(test_stock_id());
        receive(&mut stock, BloodGroup::OPos, 5, test_time());
        let before = stock.clone();

        let _ = stock.handle(&StockCommand::ReserveStock(ReserveStock {
            stock_id: stock.id_typed(),
            reservation_id: Uuid::now_v7(),
            blood_group: BloodGroup::OPos,
            units: 2,
            occurred_at: test_time(),
        }));

        assert_eq!(stock, before);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Receive { units: u32, day: i64 },
            ReserveAndSettle { units: u32 },
            ReserveAndRelease { units: u32 },
            Use { units: u32 },
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (1u32..8, 0i64..10).prop_map(|(units, day)| Op::Receive { units, day }),
                (1u32..6).prop_map(|units| Op::ReserveAndSettle { units }),
                (1u32..6).prop_map(|units| Op::ReserveAndRelease { units }),
                (1u32..4).prop_map(|units| Op::Use { units }),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: with no manual overrides, after any quiescent
            /// sequence of receive/reserve/settle/release/use operations the
            /// level counter equals the sum of active batch units.
            #[test]
            fn level_tracks_the_batch_ledger(ops in prop::collection::vec(op_strategy(), 1..40)) {
                let mut stock = HospitalStock::empty(test_stock_id());
                let group = BloodGroup::OPos;

                for op in ops {
                    match op {
                        Op::Receive { units, day } => {
                            receive(&mut stock, group, units, test_time() + Duration::days(day));
                        }
                        Op::ReserveAndSettle { units } => {
                            if let Ok(reservation_id) = reserve(&mut stock, group, units) {
                                let events = stock
                                    .handle(&StockCommand::SettleReservation(SettleReservation {
                                        stock_id: stock.id_typed(),
                                        reservation_id,
                                        occurred_at: test_time(),
                                    }))
                                    .unwrap();
                                apply_all(&mut stock, &events);
                            }
                        }
                        Op::ReserveAndRelease { units } => {
                            if let Ok(reservation_id) = reserve(&mut stock, group, units) {
                                let events = stock
                                    .handle(&StockCommand::ReleaseReservation(ReleaseReservation {
                                        stock_id: stock.id_typed(),
                                        reservation_id,
                                        occurred_at: test_time(),
                                    }))
                                    .unwrap();
                                apply_all(&mut stock, &events);
                            }
                        }
                        Op::Use { units } => {
                            let target = stock
                                .batches()
                                .iter()
                                .find(|b| b.status == BatchStatus::Active && b.units >= units)
                                .map(|b| b.id);
                            if let Some(batch_id) = target {
                                let events = stock
                                    .handle(&StockCommand::UseBatchUnits(UseBatchUnits {
                                        stock_id: stock.id_typed(),
                                        batch_id,
                                        quantity: units,
                                        action: BatchAction::Use,
                                        occurred_at: test_time(),
                                    }))
                                    .unwrap();
                                apply_all(&mut stock, &events);
                            }
                        }
                    }
                }

                prop_assert_eq!(stock.level(group), stock.active_batch_units(group));
                prop_assert!(stock.level(group) >= 0);
            }
        }
    }
}
