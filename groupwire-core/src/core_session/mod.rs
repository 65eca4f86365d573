//! Group session orchestration
//!
//! Ties identity, group engine, snapshot store and relays together into a
//! consistent session:
//!
//! - `GroupSessionOrchestrator`: the public API and the inbound pump
//! - `InviteWorkflow`: the staged add-member flow
//! - `SessionJournal`: processed ids, pending invites and deliveries
//! - `GroupEnvelope`: what travels on a group topic
//!
//! ## Invariants
//!
//! - One writer per group at a time (`GroupLocks`)
//! - A group state is persisted before it becomes the in-memory state
//! - An inbound commit or welcome is applied at most once per message id
//! - Locally authored commits stay in the journal until every event was published

pub mod envelope;
pub mod errors;
pub mod events;
pub mod invite;
pub mod journal;
pub mod locks;
pub mod orchestrator;
pub mod types;

pub use envelope::GroupEnvelope;
pub use errors::{SessionError, SessionResult};
pub use events::{EventBroadcaster, SessionEvent};
pub use invite::{InviteOutcome, InviteStage, InviteWorkflow};
pub use journal::{PendingDelivery, SessionJournal};
pub use locks::GroupLocks;
pub use orchestrator::GroupSessionOrchestrator;
pub use types::{
    CommitOutcome, CommitReceipt, GroupInfo, InviteId, KeyPackagePublication, LoginReport,
    PendingInvite, RestoreReport, WelcomeOutcome,
};
