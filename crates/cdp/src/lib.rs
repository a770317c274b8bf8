//! Contact data platform: the authoritative contact records that segments
//! evaluate against and flows mutate.

pub mod store;

pub use store::{ContactStore, ImportReport};
