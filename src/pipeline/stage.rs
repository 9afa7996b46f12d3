//! The stage contract.

use serde_json::Value;
use std::sync::Arc;

use crate::diagnostics::DiagnosticsManager;
use crate::error::SyncError;
use crate::state::{ConflictUpdate, StateStore};
use crate::subscriptions::NamespaceView;
use crate::types::{MutationDescriptor, MutationId, Timestamp};

use super::TickReport;

/// A descriptor on its way through the pipeline, with the annotations
/// stages attach to it. The descriptor itself is never modified.
#[derive(Debug)]
pub struct StagedMutation {
    pub descriptor: Arc<MutationDescriptor>,
    /// Namespace value when this descriptor entered the pipeline.
    pub preceding: Arc<Value>,
    /// Value to commit.
    pub next: Arc<Value>,
    pub conflict: ConflictUpdate,
    /// Set by the driver when a stream echo in the same tick replaces this one.
    pub superseded_by: Option<MutationId>,
    pub persist: bool,
    pub record_history: bool,
    /// Error returned to the caller even though the descriptor committed.
    pub surfaced: Option<SyncError>,
    /// Filled in by core-commit when something observable changed.
    pub committed_view: Option<NamespaceView>,
}

impl StagedMutation {
    pub fn new(descriptor: MutationDescriptor, preceding: Arc<Value>) -> Self {
        Self {
            descriptor: Arc::new(descriptor),
            next: Arc::clone(&preceding),
            preceding,
            conflict: ConflictUpdate::Keep,
            superseded_by: None,
            persist: false,
            record_history: false,
            surfaced: None,
            committed_view: None,
        }
    }

    pub fn namespace(&self) -> &str {
        self.descriptor.namespace()
    }

    /// Whether the committed value differs from the preceding one.
    pub fn value_changed(&self) -> bool {
        !Arc::ptr_eq(&self.preceding, &self.next) && *self.preceding != *self.next
    }
}

/// Why a descriptor stopped before commit.
#[derive(Debug)]
pub enum Halt {
    Rejected(SyncError),
    Superseded { by: MutationId },
}

pub enum StageOutcome {
    Continue(StagedMutation),
    Halt(Halt),
}

/// Shared collaborators handed to every stage.
pub struct StageContext<'a> {
    pub store: &'a StateStore,
    pub diagnostics: &'a DiagnosticsManager,
    pub now: Timestamp,
}

/// One step of the mutation pipeline.
///
/// A stage may transform, annotate or halt a descriptor. It can never skip
/// the stages after it.
pub trait Stage: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, staged: StagedMutation, ctx: &StageContext<'_>) -> StageOutcome;

    /// Called for every descriptor that reached commit, in stage order.
    fn committed(&mut self, _staged: &StagedMutation, _ctx: &StageContext<'_>) {}

    /// Called on every stage when a descriptor is halted, whichever stage
    /// halted it.
    fn halted(&mut self, _descriptor: &MutationDescriptor, _ctx: &StageContext<'_>) {}

    /// Called once after every descriptor of the tick has been processed.
    fn end_tick(&mut self, _ctx: &StageContext<'_>, _report: &mut TickReport) {}
}
