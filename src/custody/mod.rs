//! Client for the custody service ("Sun"): key escrow, revisioned
//! object storage, token lifecycle, audit listing.

pub mod client;
pub mod retry;

pub use client::{
    AuditEvent, CustodyClient, IssuedToken, ObjectMeta, ObjectRevision, PutResult, TokenRecord,
    WhoAmI,
};
pub use retry::{Outcome, RetryPolicy};
