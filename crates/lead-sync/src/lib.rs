//!
//! # Lead Sync
//!
//! Keeps leads consistent across every surface of one session (a funnel board, a chat panel)
//! and across sessions sharing a storage medium, without a push channel from the store.
//!
//! The moving parts:
//! - [`EntityCache`]: last known attributes per normalized lead id, the one thing surfaces read;
//! - [`identifier`]: picks the persistent id out of a primary id plus auxiliary hints;
//! - [`MutationLog`]: bounded, prune-on-read log of stage changes in a shared [`LogStorage`];
//! - [`PollingReconciler`] and [`CrossTabListener`]: [`ChangeFeed`]s merging remote changes back;
//! - [`StageTransitionService`]: stage changes with the direct → lookup → create fallback chain;
//! - [`EventBroadcaster`]: synchronous, panic isolated fan out of create/update/delete events.
//!
//! [`LeadSyncSession`] wires all of them together and owns their lifecycle.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod broadcaster;
mod cache;
mod config;
mod error;
mod migration;
mod observer;
mod record;
mod session;
mod stage;
mod transition;

pub mod feed;
pub mod identifier;
pub mod mutation_log;
pub mod store;

pub use broadcaster::{EventBroadcaster, EventOrigin, LeadEvent, LeadEventKind, LeadSignal};
pub use cache::EntityCache;
pub use config::{StoreConfig, SyncConfig};
pub use error::{Error, StorageError, StoreError, StoreStep};
pub use feed::{
	ChangeFeed, CrossTabListener, FeedContext, FeedHandle, FocusSignal, MountedFlag,
	PollingReconciler, ResyncReport, Stopper,
};
pub use identifier::{AuxiliaryIds, IdentifierBundle, Resolution, ResolvedId};
pub use migration::{MigrationReport, StageMigration};
pub use mutation_log::{LogStorage, MutationLog, MutationLogEntry, StorageChange};
pub use observer::Subscription;
pub use record::{LeadPatch, LeadRecord};
pub use session::LeadSyncSession;
pub use stage::{ParsedStage, StageId, UnknownStage};
pub use store::{FetchMode, LeadLookup, LeadProjection, LeadStore, NewLead, TenantId};
pub use transition::{StageTransitionService, TransitionFields, TransitionKind, TransitionOutcome};
