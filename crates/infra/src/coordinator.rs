//! `BloodBank` — the application-level operation set.
//!
//! Sits between the (out-of-scope) transport layer and the aggregates,
//! exactly where the command execution pipeline meets the collaborator
//! seams. Every state transition goes through one conditional append; the
//! coordinator only sequences them and performs the cross-stream side
//! effects (reservation on accept, credit on complete, refund on cancel)
//! in a fixed order, logging instead of failing when a secondary step
//! cannot follow an already-committed transition.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;

use lifelink_core::{ActorId, AggregateId, BloodGroup, DomainError};
use lifelink_events::{EventBus, EventEnvelope};
use lifelink_inventory::{
    AdjustLevel, BatchAction, BatchId, BatchSource, HospitalStock, ReapExpired, ReceiveBatch,
    ReleaseReservation, ReserveStock, SettleReservation, StockCommand, StockEvent, StockId,
    StockThresholds, UseBatchUnits, DEFAULT_SHELF_LIFE_DAYS,
};
use lifelink_requests::{
    AcceptRequest, BloodRequest, CancelRequest, CompleteRequest, CreateRequest, DispatchDetails,
    DispatchRequest, ExpireRequest, MuteRequest, RequestCommand, RequestEvent, RequestId,
    RequestKind, RequestStatus, RequiredTime,
};
use uuid::Uuid;

use crate::command_dispatcher::{CommandDispatcher, DispatchError};
use crate::directory::{ActorDirectory, ActorRole, DonationRecord};
use crate::event_store::{EventStore, StoredEvent};
use crate::notify::{broadcast_candidates, Notification, NotificationSink};
use crate::projections::inventory_levels::{classify_levels, GroupLevel};

/// Input for `create_request`.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub requester: ActorId,
    pub kind: RequestKind,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub required_time: Option<RequiredTime>,
    /// Target cities for broadcast fan-out (empty = everywhere).
    pub cities: Vec<String>,
}

/// Input for `create_batch` (manual stock entry).
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub hospital: ActorId,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub collected_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source: BatchSource,
    pub source_name: String,
}

/// The coordinator exposing the transport-independent operations.
pub struct BloodBank<S, B> {
    dispatcher: CommandDispatcher<S, B>,
    directory: Arc<dyn ActorDirectory>,
    notifier: Arc<dyn NotificationSink>,
    thresholds: StockThresholds,
}

impl<S, B> BloodBank<S, B>
where
    S: EventStore,
    B: EventBus<EventEnvelope<JsonValue>>,
{
    pub fn new(
        store: S,
        bus: B,
        directory: Arc<dyn ActorDirectory>,
        notifier: Arc<dyn NotificationSink>,
        thresholds: StockThresholds,
    ) -> Self {
        Self {
            dispatcher: CommandDispatcher::new(store, bus),
            directory,
            notifier,
            thresholds,
        }
    }

    // ---- requests -------------------------------------------------------

    /// Create a request, compute its deadline and fan out to candidates.
    ///
    /// Fan-out is best-effort: once the request is committed, nothing on
    /// the notification path can fail the call.
    pub fn create_request(
        &self,
        spec: NewRequest,
        now: DateTime<Utc>,
    ) -> Result<RequestId, DomainError> {
        if let Some(provider) = spec.kind.provider() {
            let profile = self
                .directory
                .get(provider)
                .ok_or_else(|| DomainError::validation("target provider not found"))?;
            if profile.role != ActorRole::Hospital {
                return Err(DomainError::validation(
                    "target recipient is not a valid hospital",
                ));
            }
        }

        let request_id = RequestId::new(AggregateId::new());
        self.request_command(
            request_id,
            RequestCommand::CreateRequest(CreateRequest {
                request_id,
                requester: spec.requester,
                kind: spec.kind,
                blood_group: spec.blood_group,
                units: spec.units,
                required_time: spec.required_time,
                occurred_at: now,
            }),
        )
        .map_err(DispatchError::into_domain)?;

        self.fan_out(&spec, request_id, now);

        Ok(request_id)
    }

    /// Accept a request: first accept wins, stock is promised up front.
    ///
    /// Directed kinds reserve the acceptor's stock before the lifecycle
    /// transition; if the acceptance then loses the race the reservation is
    /// released again. Expiry is evaluated lazily here.
    pub fn accept_request(
        &self,
        request_id: RequestId,
        actor: ActorId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let request = self.load_request(request_id)?;

        if request.is_past_deadline(now) {
            self.expire_quietly(request_id, now);
            return Err(DomainError::Expired);
        }

        // Fast-path checks; the aggregate re-checks all of them under the
        // version CAS, so these only avoid a pointless reservation. None of
        // them can go stale in a direction that matters: a terminal status
        // never reverts and `accepted_by` is never unset.
        match request.status() {
            RequestStatus::Completed | RequestStatus::Cancelled => {
                return Err(DomainError::invalid_transition("request is already closed"));
            }
            RequestStatus::Expired => return Err(DomainError::Expired),
            _ => {}
        }
        if let Some(provider) = request.kind().provider() {
            if provider != actor {
                return Err(DomainError::validation(
                    "only the designated provider can accept this request",
                ));
            }
        }
        match request.accepted_by() {
            Some(by) if by == actor => return Ok(()),
            Some(_) => return Err(DomainError::AlreadyAccepted),
            None => {}
        }

        let blood_group = request
            .blood_group()
            .ok_or_else(|| DomainError::conflict("request carries no blood group"))?;
        let reserves = request.kind().reserves_on_accept();

        if reserves {
            let committed = self.stock_command(
                actor,
                StockCommand::ReserveStock(ReserveStock {
                    stock_id: stock_id(actor),
                    reservation_id: reservation_key(request_id),
                    blood_group,
                    units: request.units(),
                    occurred_at: now,
                }),
            )?;
            self.warn_on_shortfall(&committed);
        }

        let accepted = self.request_command(
            request_id,
            RequestCommand::AcceptRequest(AcceptRequest {
                request_id,
                actor,
                occurred_at: now,
            }),
        );

        match accepted {
            Ok(_) => {
                self.notify_requester(
                    &request,
                    request_id,
                    "Request Accepted",
                    format!(
                        "{} has accepted your request for {} units.",
                        self.actor_name(actor),
                        request.units()
                    ),
                );
                Ok(())
            }
            Err(err) => {
                let resolved = if err.is_concurrency() {
                    // Another writer got there between our load and append;
                    // re-read to report what actually happened.
                    match self.load_request(request_id) {
                        Ok(after) if after.accepted_by() == Some(actor) => {
                            // Our own parallel retry landed; the reservation
                            // backs a real acceptance, keep it.
                            return Ok(());
                        }
                        Ok(after) if after.accepted_by().is_some() => DomainError::AlreadyAccepted,
                        Ok(after) if after.is_past_deadline(now) => DomainError::Expired,
                        Ok(_) => DomainError::conflict("concurrent update, please retry"),
                        Err(e) => e,
                    }
                } else {
                    match err.into_domain() {
                        DomainError::Expired => {
                            self.expire_quietly(request_id, now);
                            DomainError::Expired
                        }
                        other => other,
                    }
                };
                if reserves {
                    self.release_quietly(actor, request_id, now);
                }
                Err(resolved)
            }
        }
    }

    /// Mark an accepted request as on its way.
    pub fn dispatch_request(
        &self,
        request_id: RequestId,
        actor: ActorId,
        details: DispatchDetails,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let request = self.load_request(request_id)?;

        self.request_command(
            request_id,
            RequestCommand::DispatchRequest(DispatchRequest {
                request_id,
                actor,
                details,
                occurred_at: now,
            }),
        )
        .map_err(DispatchError::into_domain)?;

        self.notify_requester(
            &request,
            request_id,
            "Blood Dispatched",
            format!(
                "{} units of {} are on the way from {}.",
                request.units(),
                request.blood_group().map(|g| g.label()).unwrap_or("blood"),
                self.actor_name(actor)
            ),
        );
        Ok(())
    }

    /// Complete a request (terminal) and move the stock bookkeeping.
    ///
    /// The giver's decrement happened at accept time; completion settles
    /// that reservation, credits the receiving hospital with a fresh batch,
    /// and records the donation when the giver is a donor. Secondary steps
    /// after the committed transition log instead of failing.
    pub fn complete_request(
        &self,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let request = self.load_request(request_id)?;

        self.request_command(
            request_id,
            RequestCommand::CompleteRequest(CompleteRequest {
                request_id,
                occurred_at: now,
            }),
        )
        .map_err(DispatchError::into_domain)?;

        let Some(blood_group) = request.blood_group() else {
            return Ok(());
        };
        let units = request.units();
        let giver = request.giver();
        let giver_profile = giver.and_then(|g| self.directory.get(g));

        if request.kind().reserves_on_accept() {
            if let Some(giver) = giver {
                if let Err(e) = self.stock_command(
                    giver,
                    StockCommand::SettleReservation(SettleReservation {
                        stock_id: stock_id(giver),
                        reservation_id: reservation_key(request_id),
                        occurred_at: now,
                    }),
                ) {
                    tracing::warn!(request = %request_id, error = %e, "failed to settle reservation");
                }
            }
        }

        // Credit the receiving side: level and batch move together.
        let receiver = request.receiver();
        let receiving_hospital = receiver.filter(|r| {
            self.directory
                .get(*r)
                .map(|p| p.role == ActorRole::Hospital)
                .unwrap_or(false)
        });
        if let Some(receiver) = receiving_hospital {
            let source = match request.kind() {
                RequestKind::EmergencyBroadcast => BatchSource::Donation,
                RequestKind::P2p { .. } | RequestKind::StockTransfer { .. } => {
                    BatchSource::Transfer
                }
            };
            let source_name = giver_profile
                .as_ref()
                .map(|p| p.name.clone())
                .unwrap_or_else(|| "External Source".to_string());
            let receive = self.stock_command(
                receiver,
                StockCommand::ReceiveBatch(ReceiveBatch {
                    stock_id: stock_id(receiver),
                    batch_id: BatchId::new(),
                    blood_group,
                    units,
                    collected_at: now,
                    expires_at: now + Duration::days(DEFAULT_SHELF_LIFE_DAYS),
                    source,
                    source_name,
                    occurred_at: now,
                }),
            );
            if let Err(e) = receive {
                tracing::warn!(request = %request_id, error = %e, "failed to credit receiving hospital");
            }
        }

        // Donor bookkeeping: history record, last donation, counter.
        if let (Some(giver), Some(profile)) = (giver, giver_profile) {
            if profile.role == ActorRole::Donor {
                self.directory.record_donation(DonationRecord {
                    donor: giver,
                    hospital: receiving_hospital,
                    blood_group,
                    units,
                    occurred_at: now,
                });
            }
        }

        Ok(())
    }

    /// Cancel a request; refunds the Accept-time reservation when there was
    /// one and invalidates pending notifications.
    pub fn cancel_request(
        &self,
        request_id: RequestId,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let committed = self
            .request_command(
                request_id,
                RequestCommand::CancelRequest(CancelRequest {
                    request_id,
                    reason: reason.into(),
                    occurred_at: now,
                }),
            )
            .map_err(DispatchError::into_domain)?;

        for stored in &committed {
            if let Ok(RequestEvent::RequestCancelled(e)) = stored.decode::<RequestEvent>() {
                if let Some(acceptor) = e.refund_to {
                    self.release_quietly(acceptor, request_id, now);
                }
            }
        }

        self.notifier.invalidate(request_id);
        Ok(())
    }

    /// Lazily expire an overdue request (used by sweeps and feed reads).
    pub fn expire_request(
        &self,
        request_id: RequestId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.request_command(
            request_id,
            RequestCommand::ExpireRequest(ExpireRequest {
                request_id,
                occurred_at: now,
            }),
        )
        .map_err(DispatchError::into_domain)?;
        Ok(())
    }

    /// Hide a request from one actor's feed.
    pub fn mute_request(
        &self,
        request_id: RequestId,
        actor: ActorId,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.request_command(
            request_id,
            RequestCommand::MuteRequest(MuteRequest {
                request_id,
                actor,
                occurred_at: now,
            }),
        )
        .map_err(DispatchError::into_domain)?;
        Ok(())
    }

    /// Strongly-consistent view of one request.
    pub fn request_snapshot(&self, request_id: RequestId) -> Result<BloodRequest, DomainError> {
        self.load_request(request_id)
    }

    // ---- inventory ------------------------------------------------------

    /// Per-group availability with status classification.
    ///
    /// Runs the expiry reaper first, so the figures never include batches
    /// past their shelf life.
    pub fn get_inventory(
        &self,
        hospital: ActorId,
        now: DateTime<Utc>,
    ) -> Result<Vec<GroupLevel>, DomainError> {
        let committed = self.stock_command(
            hospital,
            StockCommand::ReapExpired(ReapExpired {
                stock_id: stock_id(hospital),
                occurred_at: now,
            }),
        )?;
        for stored in &committed {
            if let Ok(StockEvent::BatchExpired(e)) = stored.decode::<StockEvent>() {
                tracing::info!(
                    hospital = %hospital,
                    batch = %e.batch_id,
                    group = %e.blood_group,
                    reclaimed = e.reclaimed,
                    "retired expired batch"
                );
            }
        }

        let stock = self.load_stock(hospital)?;
        Ok(classify_levels(stock.levels(), &self.thresholds))
    }

    /// Manual stock entry: batch and level move together in one event.
    pub fn create_batch(&self, spec: NewBatch, now: DateTime<Utc>) -> Result<BatchId, DomainError> {
        let profile = self
            .directory
            .get(spec.hospital)
            .ok_or_else(|| DomainError::validation("unknown hospital"))?;
        if profile.role != ActorRole::Hospital {
            return Err(DomainError::validation("batches belong to hospitals"));
        }

        let batch_id = BatchId::new();
        let collected_at = spec.collected_at.unwrap_or(now);
        let expires_at = spec
            .expires_at
            .unwrap_or(collected_at + Duration::days(DEFAULT_SHELF_LIFE_DAYS));
        self.stock_command(
            spec.hospital,
            StockCommand::ReceiveBatch(ReceiveBatch {
                stock_id: stock_id(spec.hospital),
                batch_id,
                blood_group: spec.blood_group,
                units: spec.units,
                collected_at,
                expires_at,
                source: spec.source,
                source_name: spec.source_name,
                occurred_at: now,
            }),
        )?;
        Ok(batch_id)
    }

    /// Explicit staff deduction on one batch; returns the remaining units.
    pub fn use_batch_units(
        &self,
        hospital: ActorId,
        batch_id: BatchId,
        quantity: u32,
        action: BatchAction,
        now: DateTime<Utc>,
    ) -> Result<u32, DomainError> {
        let committed = self.stock_command(
            hospital,
            StockCommand::UseBatchUnits(UseBatchUnits {
                stock_id: stock_id(hospital),
                batch_id,
                quantity,
                action,
                occurred_at: now,
            }),
        )?;
        for stored in &committed {
            if let Ok(StockEvent::BatchUnitsUsed(e)) = stored.decode::<StockEvent>() {
                return Ok(e.remaining);
            }
        }
        Err(DomainError::conflict("batch deduction produced no event"))
    }

    /// Manual override of a level counter (external corrections; may drift
    /// from the batch ledger, which reads clamp and audits reveal).
    pub fn adjust_level(
        &self,
        hospital: ActorId,
        blood_group: BloodGroup,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.stock_command(
            hospital,
            StockCommand::AdjustLevel(AdjustLevel {
                stock_id: stock_id(hospital),
                blood_group,
                delta,
                occurred_at: now,
            }),
        )?;
        Ok(())
    }

    /// Audit view over the physical ledger (batch listings, reports).
    pub fn stock_snapshot(&self, hospital: ActorId) -> Result<HospitalStock, DomainError> {
        self.load_stock(hospital)
    }

    // ---- internals ------------------------------------------------------

    fn request_command(
        &self,
        request_id: RequestId,
        command: RequestCommand,
    ) -> Result<Vec<StoredEvent>, DispatchError> {
        self.dispatcher.dispatch::<BloodRequest>(
            request_id.0,
            lifelink_requests::AGGREGATE_TYPE,
            command,
            |id| BloodRequest::empty(RequestId::new(id)),
        )
    }

    fn stock_command(
        &self,
        hospital: ActorId,
        command: StockCommand,
    ) -> Result<Vec<StoredEvent>, DomainError> {
        self.dispatcher
            .dispatch::<HospitalStock>(
                hospital.as_aggregate(),
                lifelink_inventory::AGGREGATE_TYPE,
                command,
                |id| HospitalStock::empty(StockId::new(id)),
            )
            .map_err(DispatchError::into_domain)
    }

    fn load_request(&self, request_id: RequestId) -> Result<BloodRequest, DomainError> {
        let request = self
            .dispatcher
            .rehydrate::<BloodRequest>(request_id.0, |id| BloodRequest::empty(RequestId::new(id)))
            .map_err(DispatchError::into_domain)?;
        if !request.created() {
            return Err(DomainError::NotFound);
        }
        Ok(request)
    }

    fn load_stock(&self, hospital: ActorId) -> Result<HospitalStock, DomainError> {
        self.dispatcher
            .rehydrate::<HospitalStock>(hospital.as_aggregate(), |id| {
                HospitalStock::empty(StockId::new(id))
            })
            .map_err(DispatchError::into_domain)
    }

    fn expire_quietly(&self, request_id: RequestId, now: DateTime<Utc>) {
        if let Err(e) = self.expire_request(request_id, now) {
            tracing::debug!(request = %request_id, error = %e, "lazy expiry did not apply");
        }
    }

    /// Compensating refund; failures are logged, never propagated.
    fn release_quietly(&self, acceptor: ActorId, request_id: RequestId, now: DateTime<Utc>) {
        let released = self.stock_command(
            acceptor,
            StockCommand::ReleaseReservation(ReleaseReservation {
                stock_id: stock_id(acceptor),
                reservation_id: reservation_key(request_id),
                occurred_at: now,
            }),
        );
        match released {
            Ok(committed) => {
                for stored in &committed {
                    if let Ok(StockEvent::ReservationReleased(e)) = stored.decode::<StockEvent>() {
                        if e.unrestored > 0 {
                            tracing::warn!(
                                request = %request_id,
                                acceptor = %acceptor,
                                unrestored = e.unrestored,
                                "refund could not restore all drawn units (batch expired)"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(request = %request_id, acceptor = %acceptor, error = %e, "failed to release reservation");
            }
        }
    }

    fn warn_on_shortfall(&self, committed: &[StoredEvent]) {
        for stored in committed {
            if let Ok(StockEvent::StockReserved(e)) = stored.decode::<StockEvent>() {
                if e.shortfall > 0 {
                    tracing::warn!(
                        hospital = %e.stock_id,
                        group = %e.blood_group,
                        requested = e.units,
                        shortfall = e.shortfall,
                        "FIFO consumption under-delivered; level counter and batch ledger have drifted"
                    );
                }
            }
        }
    }

    fn fan_out(&self, spec: &NewRequest, request_id: RequestId, now: DateTime<Utc>) {
        match spec.kind.provider() {
            Some(provider) => {
                self.notifier.notify(
                    &[provider],
                    Notification {
                        title: "New Blood Request".to_string(),
                        body: format!(
                            "{} requested {} units of {}.",
                            self.actor_name(spec.requester),
                            spec.units,
                            spec.blood_group
                        ),
                        request_id,
                    },
                );
            }
            None => {
                let candidates = broadcast_candidates(
                    &self.directory.donors(),
                    spec.blood_group,
                    &spec.cities,
                    spec.requester,
                    now,
                );
                tracing::debug!(
                    request = %request_id,
                    candidates = candidates.len(),
                    "broadcast fan-out"
                );
                if !candidates.is_empty() {
                    self.notifier.notify(
                        &candidates,
                        Notification {
                            title: "Emergency Blood Needed!".to_string(),
                            body: format!("Urgent: {} blood needed.", spec.blood_group),
                            request_id,
                        },
                    );
                }
            }
        }
    }

    fn notify_requester(
        &self,
        request: &BloodRequest,
        request_id: RequestId,
        title: &str,
        body: String,
    ) {
        if let Some(requester) = request.requester() {
            self.notifier.notify(
                &[requester],
                Notification {
                    title: title.to_string(),
                    body,
                    request_id,
                },
            );
        }
    }

    fn actor_name(&self, id: ActorId) -> String {
        self.directory
            .get(id)
            .map(|p| p.name)
            .unwrap_or_else(|| "An unknown party".to_string())
    }
}

fn stock_id(hospital: ActorId) -> StockId {
    StockId::new(hospital.as_aggregate())
}

/// A request's uuid doubles as the reservation key in the acceptor's stock
/// stream, which is what makes reserve/settle/release idempotent per
/// request.
fn reservation_key(request_id: RequestId) -> Uuid {
    *request_id.0.as_uuid()
}
