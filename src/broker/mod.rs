//! Broker-side serving of journal fragment listings.

mod fragments_api;

pub use fragments_api::{
    DEFAULT_PAGE_LIMIT, DEFAULT_SIGNATURE_TTL, FragmentTuple, FragmentsProxy, FragmentsRequest,
    FragmentsResponse, FragmentsService, Resolution, Resolver, RouteHeader, Status,
};

use thiserror::Error;

use crate::fragment::{StoreError, WalkError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("invalid fragments request: {reason}")]
    InvalidRequest { reason: String },
    #[error(transparent)]
    Walk(#[from] WalkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("journal resolved to a remote broker but no proxy client is configured")]
    NoProxy,
}
