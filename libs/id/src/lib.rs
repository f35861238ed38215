//! # vnet-id
//!
//! Typed identifiers for the records the controller creates itself.
//!
//! Cloud resources (subnets, route tables, gateways) keep the opaque IDs the
//! provider hands out and are plain strings everywhere. Records minted by the
//! controller use a prefixed ULID: `{prefix}_{ulid}`.
//!
//! - `task_01HV4Z2WQXKJNM8GPQY6VBKC3D` identifies a queued unit of work
//! - `batch_01HV4Z3MXNKPQR9HSTZ7WCLD4E` groups tasks submitted together
//! - `rsv_01HV4Z4NYPLTRS0JTUA8XDME5F` identifies one reservation (lock holder)
//!
//! ULIDs sort by creation time, so `ORDER BY id` on a text column is a stable
//! secondary order after `added_at`.

mod error;
mod macros;
mod types;

pub use error::IdError;
#[doc(hidden)]
pub use error::parse_prefixed;
pub use types::*;

pub use ulid::Ulid;
