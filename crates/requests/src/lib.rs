//! `lifelink-requests` — the blood request lifecycle aggregate.

pub mod request;
pub mod required_time;

pub use request::{
    AcceptRequest, BloodRequest, CancelRequest, CompleteRequest, CreateRequest, DispatchDetails,
    DispatchRequest, ExpireRequest, MuteRequest, RequestCommand, RequestEvent, RequestId,
    RequestKind, RequestStatus, AGGREGATE_TYPE,
};
pub use required_time::RequiredTime;
