//! Compliance attachment backend
//!
//! Attaches and detaches compliance modulesets and rulesets on inventory
//! nodes. Every workflow runs inside a [`session::Session`]: one unit of
//! work against the store, bounded by a deadline, with the set of touched
//! tables published to the event relay only after a successful commit.
//!
//! Retention jobs in [`purge`] drop orphaned attachments and outdated
//! status rows through the same session machinery.

pub mod compliance;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod notify;
pub mod purge;
pub mod routes;
pub mod session;
pub mod state;
