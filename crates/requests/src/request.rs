use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use lifelink_core::{ActorId, Aggregate, AggregateId, AggregateRoot, BloodGroup, DomainError};
use lifelink_events::Event;

use crate::required_time::RequiredTime;

/// Stream type identifier for blood request aggregates.
pub const AGGREGATE_TYPE: &str = "requests.blood_request";

/// Blood request identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub AggregateId);

impl RequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// The shape of a request, fixed at creation.
///
/// Directed kinds name their provider up front; for a broadcast the giver is
/// whoever accepts. Direction never has to be re-derived from nullable
/// fields at transition time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    /// Broadcast to compatible donors; any of them may claim it.
    EmergencyBroadcast,
    /// Directed at one providing hospital on behalf of a patient.
    P2p { provider: ActorId },
    /// Hospital-to-hospital stock movement.
    StockTransfer { provider: ActorId },
}

impl RequestKind {
    /// The designated provider, if the kind is directed.
    pub fn provider(&self) -> Option<ActorId> {
        match self {
            RequestKind::EmergencyBroadcast => None,
            RequestKind::P2p { provider } | RequestKind::StockTransfer { provider } => {
                Some(*provider)
            }
        }
    }

    /// Directed kinds promise physical stock, so acceptance must reserve it
    /// immediately; a broadcast acceptance promises a donor's visit, not
    /// shelf stock.
    pub fn reserves_on_accept(&self) -> bool {
        matches!(
            self,
            RequestKind::P2p { .. } | RequestKind::StockTransfer { .. }
        )
    }
}

/// Request lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Active,
    Accepted,
    Dispatched,
    Completed,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }
}

/// Courier details recorded when an accepted request is dispatched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchDetails {
    pub transport_mode: Option<String>,
    pub tracking_id: Option<String>,
}

/// Aggregate root: BloodRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloodRequest {
    id: RequestId,
    requester: Option<ActorId>,
    kind: RequestKind,
    blood_group: Option<BloodGroup>,
    units: u32,
    status: RequestStatus,
    created_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    accepted_by: Option<ActorId>,
    accepted_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancel_reason: Option<String>,
    dispatch_details: Option<DispatchDetails>,
    ignored_by: BTreeSet<ActorId>,
    version: u64,
    created: bool,
}

impl BloodRequest {
    /// Create an empty, not-yet-created aggregate instance for rehydration.
    pub fn empty(id: RequestId) -> Self {
        Self {
            id,
            requester: None,
            kind: RequestKind::EmergencyBroadcast,
            blood_group: None,
            units: 0,
            status: RequestStatus::Active,
            created_at: None,
            expires_at: None,
            accepted_by: None,
            accepted_at: None,
            completed_at: None,
            cancel_reason: None,
            dispatch_details: None,
            ignored_by: BTreeSet::new(),
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RequestId {
        self.id
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn requester(&self) -> Option<ActorId> {
        self.requester
    }

    pub fn kind(&self) -> &RequestKind {
        &self.kind
    }

    pub fn blood_group(&self) -> Option<BloodGroup> {
        self.blood_group
    }

    pub fn units(&self) -> u32 {
        self.units
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn accepted_by(&self) -> Option<ActorId> {
        self.accepted_by
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn dispatch_details(&self) -> Option<&DispatchDetails> {
        self.dispatch_details.as_ref()
    }

    pub fn ignored_by(&self) -> &BTreeSet<ActorId> {
        &self.ignored_by
    }

    /// The side giving stock: the designated provider for directed kinds,
    /// otherwise whoever accepted the broadcast.
    pub fn giver(&self) -> Option<ActorId> {
        self.accepted_by.or(self.kind.provider())
    }

    /// The side receiving stock (always the requester).
    pub fn receiver(&self) -> Option<ActorId> {
        self.requester
    }

    /// Whether the deadline has passed for a still-active request.
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        self.status == RequestStatus::Active
            && self.expires_at.map(|at| at < now).unwrap_or(false)
    }
}

impl AggregateRoot for BloodRequest {
    type Id = RequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRequest {
    pub request_id: RequestId,
    pub requester: ActorId,
    pub kind: RequestKind,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub required_time: Option<RequiredTime>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: AcceptRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DispatchRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub details: DispatchDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CompleteRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteRequest {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub request_id: RequestId,
    pub reason: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ExpireRequest (lazy, driven by reads and accept attempts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpireRequest {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MuteRequest (an actor hides the request from their feed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuteRequest {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestCommand {
    CreateRequest(CreateRequest),
    AcceptRequest(AcceptRequest),
    DispatchRequest(DispatchRequest),
    CompleteRequest(CompleteRequest),
    CancelRequest(CancelRequest),
    ExpireRequest(ExpireRequest),
    MuteRequest(MuteRequest),
}

/// Event: RequestCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCreated {
    pub request_id: RequestId,
    pub requester: ActorId,
    pub kind: RequestKind,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub expires_at: DateTime<Utc>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestAccepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAccepted {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestDispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestDispatched {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub details: DispatchDetails,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCompleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCompleted {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestCancelled.
///
/// `refund_to` names the acceptor whose Accept-time reservation must be
/// released, when there was one. The acceptor itself stays on the request
/// for audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCancelled {
    pub request_id: RequestId,
    pub reason: String,
    pub refund_to: Option<ActorId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestExpired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestExpired {
    pub request_id: RequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RequestMuted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMuted {
    pub request_id: RequestId,
    pub actor: ActorId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestEvent {
    RequestCreated(RequestCreated),
    RequestAccepted(RequestAccepted),
    RequestDispatched(RequestDispatched),
    RequestCompleted(RequestCompleted),
    RequestCancelled(RequestCancelled),
    RequestExpired(RequestExpired),
    RequestMuted(RequestMuted),
}

impl Event for RequestEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RequestEvent::RequestCreated(_) => "request.created",
            RequestEvent::RequestAccepted(_) => "request.accepted",
            RequestEvent::RequestDispatched(_) => "request.dispatched",
            RequestEvent::RequestCompleted(_) => "request.completed",
            RequestEvent::RequestCancelled(_) => "request.cancelled",
            RequestEvent::RequestExpired(_) => "request.expired",
            RequestEvent::RequestMuted(_) => "request.muted",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RequestEvent::RequestCreated(e) => e.occurred_at,
            RequestEvent::RequestAccepted(e) => e.occurred_at,
            RequestEvent::RequestDispatched(e) => e.occurred_at,
            RequestEvent::RequestCompleted(e) => e.occurred_at,
            RequestEvent::RequestCancelled(e) => e.occurred_at,
            RequestEvent::RequestExpired(e) => e.occurred_at,
            RequestEvent::RequestMuted(e) => e.occurred_at,
        }
    }
}

impl Aggregate for BloodRequest {
    type Command = RequestCommand;
    type Event = RequestEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RequestEvent::RequestCreated(e) => {
                self.id = e.request_id;
                self.requester = Some(e.requester);
                self.kind = e.kind;
                self.blood_group = Some(e.blood_group);
                self.units = e.units;
                self.status = RequestStatus::Active;
                self.created_at = Some(e.occurred_at);
                self.expires_at = Some(e.expires_at);
                self.created = true;
            }
            RequestEvent::RequestAccepted(e) => {
                self.status = RequestStatus::Accepted;
                self.accepted_by = Some(e.actor);
                self.accepted_at = Some(e.occurred_at);
            }
            RequestEvent::RequestDispatched(e) => {
                self.status = RequestStatus::Dispatched;
                self.dispatch_details = Some(e.details.clone());
            }
            RequestEvent::RequestCompleted(e) => {
                self.status = RequestStatus::Completed;
                self.completed_at = Some(e.occurred_at);
            }
            RequestEvent::RequestCancelled(e) => {
                // `accepted_by` is retained for audit.
                self.status = RequestStatus::Cancelled;
                self.cancel_reason = Some(e.reason.clone());
            }
            RequestEvent::RequestExpired(_) => {
                self.status = RequestStatus::Expired;
            }
            RequestEvent::RequestMuted(e) => {
                self.ignored_by.insert(e.actor);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RequestCommand::CreateRequest(cmd) => self.handle_create(cmd),
            RequestCommand::AcceptRequest(cmd) => self.handle_accept(cmd),
            RequestCommand::DispatchRequest(cmd) => self.handle_dispatch(cmd),
            RequestCommand::CompleteRequest(cmd) => self.handle_complete(cmd),
            RequestCommand::CancelRequest(cmd) => self.handle_cancel(cmd),
            RequestCommand::ExpireRequest(cmd) => self.handle_expire(cmd),
            RequestCommand::MuteRequest(cmd) => self.handle_mute(cmd),
        }
    }
}

impl BloodRequest {
    fn ensure_request_id(&self, request_id: RequestId) -> Result<(), DomainError> {
        if self.id != request_id {
            return Err(DomainError::conflict("request_id mismatch"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("request already exists"));
        }
        if cmd.units == 0 {
            return Err(DomainError::validation("units must be greater than 0"));
        }
        if cmd.kind.provider() == Some(cmd.requester) {
            return Err(DomainError::validation(
                "cannot request blood from yourself",
            ));
        }

        let expires_at = RequiredTime::deadline_or_default(cmd.required_time, cmd.occurred_at);

        Ok(vec![RequestEvent::RequestCreated(RequestCreated {
            request_id: cmd.request_id,
            requester: cmd.requester,
            kind: cmd.kind,
            blood_group: cmd.blood_group,
            units: cmd.units,
            expires_at,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_accept(&self, cmd: &AcceptRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        match self.status {
            RequestStatus::Completed | RequestStatus::Cancelled => {
                return Err(DomainError::invalid_transition(
                    "request is already closed",
                ));
            }
            RequestStatus::Expired => return Err(DomainError::Expired),
            _ => {}
        }

        if self.is_past_deadline(cmd.occurred_at) {
            return Err(DomainError::Expired);
        }

        // Directed requests are addressed to one provider; nobody else can
        // claim them.
        if let Some(provider) = self.kind.provider() {
            if provider != cmd.actor {
                return Err(DomainError::validation(
                    "only the designated provider can accept this request",
                ));
            }
        }

        match self.accepted_by {
            // The same actor retrying is an idempotent success.
            Some(by) if by == cmd.actor => return Ok(vec![]),
            Some(_) => return Err(DomainError::AlreadyAccepted),
            None => {}
        }

        Ok(vec![RequestEvent::RequestAccepted(RequestAccepted {
            request_id: cmd.request_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_dispatch(&self, cmd: &DispatchRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        if self.status == RequestStatus::Dispatched && self.accepted_by == Some(cmd.actor) {
            return Ok(vec![]);
        }
        if self.status != RequestStatus::Accepted {
            return Err(DomainError::invalid_transition(
                "only accepted requests can be dispatched",
            ));
        }
        if self.accepted_by != Some(cmd.actor) {
            return Err(DomainError::invalid_transition(
                "only the accepting actor can dispatch",
            ));
        }

        Ok(vec![RequestEvent::RequestDispatched(RequestDispatched {
            request_id: cmd.request_id,
            actor: cmd.actor,
            details: cmd.details.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_complete(&self, cmd: &CompleteRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        if !matches!(
            self.status,
            RequestStatus::Accepted | RequestStatus::Dispatched
        ) {
            return Err(DomainError::invalid_transition(
                "only accepted or dispatched requests can be completed",
            ));
        }

        Ok(vec![RequestEvent::RequestCompleted(RequestCompleted {
            request_id: cmd.request_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        match self.status {
            RequestStatus::Completed => {
                return Err(DomainError::invalid_transition(
                    "completed requests are immutable",
                ));
            }
            RequestStatus::Expired => {
                return Err(DomainError::invalid_transition(
                    "expired requests cannot be cancelled",
                ));
            }
            // Cancelling twice is an idempotent no-op.
            RequestStatus::Cancelled => return Ok(vec![]),
            _ => {}
        }

        // An accepted directed request reserved the acceptor's stock; name
        // them so the reservation gets released, symmetric with acceptance.
        let refund_to = if self.kind.reserves_on_accept() {
            self.accepted_by
        } else {
            None
        };

        Ok(vec![RequestEvent::RequestCancelled(RequestCancelled {
            request_id: cmd.request_id,
            reason: cmd.reason.clone(),
            refund_to,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_expire(&self, cmd: &ExpireRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        // Lazy sweeps may race each other; only an active request past its
        // deadline actually expires, everything else is a no-op.
        if !self.is_past_deadline(cmd.occurred_at) {
            return Ok(vec![]);
        }

        Ok(vec![RequestEvent::RequestExpired(RequestExpired {
            request_id: cmd.request_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mute(&self, cmd: &MuteRequest) -> Result<Vec<RequestEvent>, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_request_id(cmd.request_id)?;

        if self.status != RequestStatus::Active || self.ignored_by.contains(&cmd.actor) {
            return Ok(vec![]);
        }

        Ok(vec![RequestEvent::RequestMuted(RequestMuted {
            request_id: cmd.request_id,
            actor: cmd.actor,
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use lifelink_core::AggregateId;

    fn test_request_id() -> RequestId {
        RequestId::new(AggregateId::new())
    }

    fn test_actor() -> ActorId {
        ActorId::new()
    }

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, 9, 0, 0).unwrap()
    }

    fn create_cmd(request_id: RequestId, requester: ActorId, kind: RequestKind) -> CreateRequest {
        CreateRequest {
            request_id,
            requester,
            kind,
            blood_group: BloodGroup::OPos,
            units: 2,
            required_time: None,
            occurred_at: test_time(),
        }
    }

    fn created_request(kind: RequestKind) -> (BloodRequest, ActorId) {
        let request_id = test_request_id();
        let requester = test_actor();
        let mut request = BloodRequest::empty(request_id);
        let events = request
            .handle(&RequestCommand::CreateRequest(create_cmd(
                request_id, requester, kind,
            )))
            .unwrap();
        request.apply(&events[0]);
        (request, requester)
    }

    fn accepted_request(kind: RequestKind) -> (BloodRequest, ActorId, ActorId) {
        let (mut request, requester) = created_request(kind);
        let acceptor = test_actor();
        let events = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: acceptor,
                occurred_at: test_time() + Duration::minutes(5),
            }))
            .unwrap();
        request.apply(&events[0]);
        (request, requester, acceptor)
    }

    #[test]
    fn create_computes_the_default_deadline() {
        let (request, requester) = created_request(RequestKind::EmergencyBroadcast);
        assert_eq!(request.status(), RequestStatus::Active);
        assert_eq!(request.requester(), Some(requester));
        assert_eq!(request.expires_at(), Some(test_time() + Duration::hours(24)));
    }

    #[test]
    fn create_honours_the_urgency_label() {
        let request_id = test_request_id();
        let request = BloodRequest::empty(request_id);
        let mut cmd = create_cmd(request_id, test_actor(), RequestKind::EmergencyBroadcast);
        cmd.required_time = Some(RequiredTime::TwoHours);

        let events = request
            .handle(&RequestCommand::CreateRequest(cmd))
            .unwrap();
        match &events[0] {
            RequestEvent::RequestCreated(e) => {
                assert_eq!(e.expires_at, test_time() + Duration::hours(2));
            }
            _ => panic!("Expected RequestCreated event"),
        }
    }

    #[test]
    fn zero_units_are_rejected() {
        let request_id = test_request_id();
        let request = BloodRequest::empty(request_id);
        let mut cmd = create_cmd(request_id, test_actor(), RequestKind::EmergencyBroadcast);
        cmd.units = 0;

        let err = request
            .handle(&RequestCommand::CreateRequest(cmd))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn self_targeted_directed_request_is_rejected() {
        let request_id = test_request_id();
        let requester = test_actor();
        let request = BloodRequest::empty(request_id);
        let cmd = create_cmd(
            request_id,
            requester,
            RequestKind::P2p {
                provider: requester,
            },
        );

        let err = request
            .handle(&RequestCommand::CreateRequest(cmd))
            .unwrap_err();
        match err {
            DomainError::Validation(msg) => assert!(msg.contains("yourself")),
            _ => panic!("Expected Validation error"),
        }
    }

    #[test]
    fn first_accept_wins_and_is_idempotent_for_the_winner() {
        let (mut request, _) = created_request(RequestKind::EmergencyBroadcast);
        let winner = test_actor();
        let loser = test_actor();
        let at = test_time() + Duration::minutes(1);

        let events = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: winner,
                occurred_at: at,
            }))
            .unwrap();
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Accepted);
        assert_eq!(request.accepted_by(), Some(winner));

        // Retried by the winner: idempotent success, no new events.
        let retried = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: winner,
                occurred_at: at,
            }))
            .unwrap();
        assert!(retried.is_empty());

        // A different actor is turned away.
        let err = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: loser,
                occurred_at: at,
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::AlreadyAccepted);
    }

    #[test]
    fn accept_after_the_deadline_reports_expired() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        let err = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: test_actor(),
                occurred_at: test_time() + Duration::hours(25),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::Expired);
    }

    #[test]
    fn expire_transitions_an_overdue_request_and_is_idempotent() {
        let (mut request, _) = created_request(RequestKind::EmergencyBroadcast);
        let late = test_time() + Duration::hours(25);

        let events = request
            .handle(&RequestCommand::ExpireRequest(ExpireRequest {
                request_id: request.id_typed(),
                occurred_at: late,
            }))
            .unwrap();
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Expired);

        let again = request
            .handle(&RequestCommand::ExpireRequest(ExpireRequest {
                request_id: request.id_typed(),
                occurred_at: late,
            }))
            .unwrap();
        assert!(again.is_empty());

        // Not acceptable afterwards, even on retry.
        let err = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: test_actor(),
                occurred_at: late,
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::Expired);
    }

    #[test]
    fn expire_before_the_deadline_is_a_no_op() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        let events = request
            .handle(&RequestCommand::ExpireRequest(ExpireRequest {
                request_id: request.id_typed(),
                occurred_at: test_time() + Duration::hours(1),
            }))
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn complete_requires_acceptance_first() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        let err = request
            .handle(&RequestCommand::CompleteRequest(CompleteRequest {
                request_id: request.id_typed(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));
    }

    #[test]
    fn completed_is_terminal_for_every_command() {
        let (mut request, _, acceptor) = accepted_request(RequestKind::EmergencyBroadcast);
        let events = request
            .handle(&RequestCommand::CompleteRequest(CompleteRequest {
                request_id: request.id_typed(),
                occurred_at: test_time() + Duration::minutes(10),
            }))
            .unwrap();
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Completed);

        let at = test_time() + Duration::minutes(11);
        let accept = request.handle(&RequestCommand::AcceptRequest(AcceptRequest {
            request_id: request.id_typed(),
            actor: acceptor,
            occurred_at: at,
        }));
        assert!(matches!(accept, Err(DomainError::InvalidTransition(_))));

        let cancel = request.handle(&RequestCommand::CancelRequest(CancelRequest {
            request_id: request.id_typed(),
            reason: "changed my mind".to_string(),
            occurred_at: at,
        }));
        assert!(matches!(cancel, Err(DomainError::InvalidTransition(_))));

        let complete = request.handle(&RequestCommand::CompleteRequest(CompleteRequest {
            request_id: request.id_typed(),
            occurred_at: at,
        }));
        assert!(matches!(complete, Err(DomainError::InvalidTransition(_))));
    }

    #[test]
    fn only_the_designated_provider_can_accept_a_directed_request() {
        let provider = test_actor();
        let (request, _) = created_request(RequestKind::P2p { provider });
        let err = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: test_actor(),
                occurred_at: test_time() + Duration::minutes(1),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn cancel_after_accept_names_the_acceptor_for_refund() {
        let provider = test_actor();
        let (mut request, _) = created_request(RequestKind::StockTransfer { provider });
        let acceptor = provider;
        let events = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: acceptor,
                occurred_at: test_time() + Duration::minutes(5),
            }))
            .unwrap();
        request.apply(&events[0]);

        let events = request
            .handle(&RequestCommand::CancelRequest(CancelRequest {
                request_id: request.id_typed(),
                reason: "no longer needed".to_string(),
                occurred_at: test_time() + Duration::minutes(20),
            }))
            .unwrap();
        match &events[0] {
            RequestEvent::RequestCancelled(e) => {
                assert_eq!(e.refund_to, Some(acceptor));
                assert_eq!(e.reason, "no longer needed");
            }
            _ => panic!("Expected RequestCancelled event"),
        }
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Cancelled);
        // Retained for audit.
        assert_eq!(request.accepted_by(), Some(acceptor));
    }

    #[test]
    fn cancel_of_an_unaccepted_request_needs_no_refund() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        let events = request
            .handle(&RequestCommand::CancelRequest(CancelRequest {
                request_id: request.id_typed(),
                reason: "resolved locally".to_string(),
                occurred_at: test_time() + Duration::minutes(5),
            }))
            .unwrap();
        match &events[0] {
            RequestEvent::RequestCancelled(e) => assert_eq!(e.refund_to, None),
            _ => panic!("Expected RequestCancelled event"),
        }
    }

    #[test]
    fn accepted_broadcast_cancel_carries_no_refund() {
        let (request, _, _) = accepted_request(RequestKind::EmergencyBroadcast);
        let events = request
            .handle(&RequestCommand::CancelRequest(CancelRequest {
                request_id: request.id_typed(),
                reason: "donor unavailable".to_string(),
                occurred_at: test_time() + Duration::minutes(20),
            }))
            .unwrap();
        match &events[0] {
            RequestEvent::RequestCancelled(e) => assert_eq!(e.refund_to, None),
            _ => panic!("Expected RequestCancelled event"),
        }
    }

    #[test]
    fn dispatch_is_reserved_to_the_acceptor() {
        let (mut request, _, acceptor) = accepted_request(RequestKind::EmergencyBroadcast);
        let stranger = test_actor();
        let at = test_time() + Duration::minutes(30);

        let err = request
            .handle(&RequestCommand::DispatchRequest(DispatchRequest {
                request_id: request.id_typed(),
                actor: stranger,
                details: DispatchDetails::default(),
                occurred_at: at,
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition(_)));

        let events = request
            .handle(&RequestCommand::DispatchRequest(DispatchRequest {
                request_id: request.id_typed(),
                actor: acceptor,
                details: DispatchDetails {
                    transport_mode: Some("courier".to_string()),
                    tracking_id: Some("TRK-17".to_string()),
                },
                occurred_at: at,
            }))
            .unwrap();
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Dispatched);

        // Dispatched requests can still complete.
        let events = request
            .handle(&RequestCommand::CompleteRequest(CompleteRequest {
                request_id: request.id_typed(),
                occurred_at: at + Duration::hours(1),
            }))
            .unwrap();
        request.apply(&events[0]);
        assert_eq!(request.status(), RequestStatus::Completed);
    }

    #[test]
    fn muting_hides_but_never_blocks() {
        let (mut request, _) = created_request(RequestKind::EmergencyBroadcast);
        let donor = test_actor();

        let events = request
            .handle(&RequestCommand::MuteRequest(MuteRequest {
                request_id: request.id_typed(),
                actor: donor,
                occurred_at: test_time(),
            }))
            .unwrap();
        request.apply(&events[0]);
        assert!(request.ignored_by().contains(&donor));

        // Muting twice is a no-op.
        let again = request
            .handle(&RequestCommand::MuteRequest(MuteRequest {
                request_id: request.id_typed(),
                actor: donor,
                occurred_at: test_time(),
            }))
            .unwrap();
        assert!(again.is_empty());

        // A muted donor can still accept (mute is a feed preference).
        let accepted = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: donor,
                occurred_at: test_time() + Duration::minutes(1),
            }))
            .unwrap();
        assert_eq!(accepted.len(), 1);
    }

    #[test]
    fn giver_is_the_provider_for_directed_kinds_and_the_acceptor_for_broadcasts() {
        let provider = test_actor();
        let (request, requester) = created_request(RequestKind::P2p { provider });
        assert_eq!(request.giver(), Some(provider));
        assert_eq!(request.receiver(), Some(requester));

        let (request, requester, acceptor) = accepted_request(RequestKind::EmergencyBroadcast);
        assert_eq!(request.giver(), Some(acceptor));
        assert_eq!(request.receiver(), Some(requester));
    }

    #[test]
    fn commands_on_a_missing_request_report_not_found() {
        let request = BloodRequest::empty(test_request_id());
        let err = request
            .handle(&RequestCommand::AcceptRequest(AcceptRequest {
                request_id: request.id_typed(),
                actor: test_actor(),
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert_eq!(err, DomainError::NotFound);
    }

    #[test]
    fn handle_does_not_mutate_state() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        let before = request.clone();

        let _ = request.handle(&RequestCommand::AcceptRequest(AcceptRequest {
            request_id: request.id_typed(),
            actor: test_actor(),
            occurred_at: test_time() + Duration::minutes(1),
        }));

        assert_eq!(request, before);
    }

    #[test]
    fn version_increments_on_apply() {
        let (request, _) = created_request(RequestKind::EmergencyBroadcast);
        assert_eq!(request.version(), 1);

        let (request, _, _) = accepted_request(RequestKind::EmergencyBroadcast);
        assert_eq!(request.version(), 2);
    }
}
