//! Store Module
//!
//! Typed object persistence on top of the retrying clients.
//!
//! ## Responsibilities
//! - Atomic save/delete of payloads together with entity-set membership
//! - Optimistic read-modify-write with bounded conflict retries
//! - Paged, snapshot-based iteration over a family's records
//!
//! ## Consistency
//! Every write is one backend transaction. `modify` and `modify_many`
//! watch the versions they read and start over when another writer got
//! there first.

mod async_store;
mod iterator;
mod object_store;
mod plan;

pub use async_store::AsyncObjectStore;
pub use iterator::{AsyncObjIter, ObjIter};
pub use object_store::ObjectStore;
pub use plan::GetOptions;
