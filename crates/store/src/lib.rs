//! Gantry store: the cluster-state reconciliation engine.
//!
//! Raw change notifications flow through [`ChangeProcessor`], which keeps a
//! de-duplicated, kind-indexed snapshot of the cluster ([`ClusterState`]) and
//! classifies how significant the accumulated changes are
//! ([`gantry_core::ChangeSeverity`]). Nothing in this crate logs; callers
//! decide what to report.

#![forbid(unsafe_code)]

mod multi;
mod processor;
mod registry;
pub mod relevance;
mod tracker;
mod typed;

pub use multi::{ClusterState, KindFn, MultiKindStore};
pub use processor::{
    ChangeProcessor, GraphBuilder, GraphReader, ProcessError, Processed, ProcessorConfig, Rejection, Validator,
};
pub use registry::{KindRegistry, KindRegistryBuilder, KindSummary, RegistryError};
pub use relevance::RelevanceRule;
pub use tracker::ChangeTracker;
pub use typed::TypedStore;
