use std::collections::{BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use lifelink_core::{ActorId, AggregateId, BloodGroup};
use lifelink_events::EventEnvelope;
use lifelink_requests::{RequestEvent, RequestId, RequestKind, RequestStatus};

use crate::read_model::ReadStore;

use super::inventory_levels::ProjectionError;

/// One entry in the request board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFeedItem {
    pub request_id: RequestId,
    pub requester: ActorId,
    pub kind: RequestKind,
    pub blood_group: BloodGroup,
    pub units: u32,
    pub status: RequestStatus,
    pub expires_at: DateTime<Utc>,
    pub accepted_by: Option<ActorId>,
    pub ignored_by: BTreeSet<ActorId>,
}

/// Request feed projection: the listing view donors and hospitals poll.
///
/// A read-only consumer of the lifecycle events; acceptance and expiry
/// decisions always go back through the aggregate.
#[derive(Debug)]
pub struct RequestFeedProjection<S>
where
    S: ReadStore<AggregateId, RequestFeedItem>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> RequestFeedProjection<S>
where
    S: ReadStore<AggregateId, RequestFeedItem>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, request_id: RequestId) -> Option<RequestFeedItem> {
        self.store.get(&request_id.0)
    }

    /// Open requests a viewer should see: still active and unexpired at
    /// `now`, not their own, not muted by them, and (when their blood group
    /// is known) one their blood can serve.
    pub fn active_for(
        &self,
        viewer: ActorId,
        viewer_group: Option<BloodGroup>,
        now: DateTime<Utc>,
    ) -> Vec<RequestFeedItem> {
        let mut items: Vec<RequestFeedItem> = self
            .store
            .list()
            .into_iter()
            .filter(|item| {
                item.status == RequestStatus::Active
                    && item.expires_at >= now
                    && item.requester != viewer
                    && !item.ignored_by.contains(&viewer)
                    && match (viewer_group, item.kind.provider()) {
                        // Directed requests only appear to their provider.
                        (_, Some(provider)) => provider == viewer,
                        (Some(group), None) => group.can_donate_to(item.blood_group),
                        (None, None) => true,
                    }
            })
            .collect();
        items.sort_by_key(|item| item.expires_at);
        items
    }

    /// Apply a published envelope into the projection.
    pub fn apply_envelope(
        &self,
        envelope: &EventEnvelope<JsonValue>,
    ) -> Result<(), ProjectionError> {
        if envelope.aggregate_type() != lifelink_requests::AGGREGATE_TYPE {
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
            return Ok(());
        }
        if last != 0 && seq != last + 1 {
            return Err(ProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: RequestEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| ProjectionError::Deserialize(e.to_string()))?;

        match &event {
            RequestEvent::RequestCreated(e) => {
                self.store.upsert(
                    aggregate_id,
                    RequestFeedItem {
                        request_id: e.request_id,
                        requester: e.requester,
                        kind: e.kind,
                        blood_group: e.blood_group,
                        units: e.units,
                        status: RequestStatus::Active,
                        expires_at: e.expires_at,
                        accepted_by: None,
                        ignored_by: BTreeSet::new(),
                    },
                );
            }
            other => {
                let Some(mut item) = self.store.get(&aggregate_id) else {
                    return Err(ProjectionError::StreamMismatch(
                        "lifecycle event for an unknown request".to_string(),
                    ));
                };
                match other {
                    RequestEvent::RequestCreated(_) => {}
                    RequestEvent::RequestAccepted(e) => {
                        item.status = RequestStatus::Accepted;
                        item.accepted_by = Some(e.actor);
                    }
                    RequestEvent::RequestDispatched(_) => {
                        item.status = RequestStatus::Dispatched;
                    }
                    RequestEvent::RequestCompleted(_) => {
                        item.status = RequestStatus::Completed;
                    }
                    RequestEvent::RequestCancelled(_) => {
                        item.status = RequestStatus::Cancelled;
                    }
                    RequestEvent::RequestExpired(_) => {
                        item.status = RequestStatus::Expired;
                    }
                    RequestEvent::RequestMuted(e) => {
                        item.ignored_by.insert(e.actor);
                    }
                }
                self.store.upsert(aggregate_id, item);
            }
        }

        cursors.insert(aggregate_id, seq);

        Ok(())
    }
}
