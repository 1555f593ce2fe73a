//! Committed/pending parameter staging.
//!
//! Every derived artifact edits a `pending` parameter set freely and calls
//! [`StagingRecord::reconcile`] once per frame. The record compares pending
//! against `committed` (what the backend currently reflects) and decides:
//!
//! * structural diff: allocate buffers sized from pending, recompute, then
//!   drop the old buffers;
//! * parametric diff: recompute in place;
//! * no diff: skip, unless the parameters ask to recompute every frame.
//!
//! If allocation or the recompute fails, the previous buffers and committed
//! parameters stay in place and the next frame tries again.

use std::ops::BitOr;

use vis_api::interface::BackendError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecomputePolicy {
    /// Equal parameters mean the buffers are current.
    #[default]
    CacheOnEqual,
    /// Time-integrated output that must advance every frame.
    AlwaysRecompute,
    /// Output depends on the camera; parameter equality proves nothing.
    ViewDependent,
}

pub trait StagedParams: Clone {
    /// Differences that change buffer sizes.
    fn structural_diff(&self, other: &Self) -> bool;
    /// Differences that only change kernel parameters.
    fn parametric_diff(&self, other: &Self) -> bool;
    fn policy(&self) -> RecomputePolicy {
        RecomputePolicy::CacheOnEqual
    }
}

/// Change signals that do not live in the parameter set, such as a moved
/// manipulation box or new upstream data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExternalDirty {
    pub structural: bool,
    pub parametric: bool,
}

impl ExternalDirty {
    pub const NONE: ExternalDirty = ExternalDirty {
        structural: false,
        parametric: false,
    };

    pub fn structural(flag: bool) -> Self {
        Self {
            structural: flag,
            parametric: false,
        }
    }

    pub fn parametric(flag: bool) -> Self {
        Self {
            structural: false,
            parametric: flag,
        }
    }
}

impl BitOr for ExternalDirty {
    type Output = ExternalDirty;

    fn bitor(self, rhs: Self) -> Self::Output {
        ExternalDirty {
            structural: self.structural || rhs.structural,
            parametric: self.parametric || rhs.parametric,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffClass {
    Structural,
    Parametric,
    Clean,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// New buffers were allocated and filled.
    Reallocated,
    /// Existing buffers were recomputed.
    Recomputed,
    /// Cache hit.
    Skipped,
    /// The backend failed; previous state kept.
    Aborted,
}

impl ReconcileOutcome {
    pub fn recomputed(self) -> bool {
        matches!(self, ReconcileOutcome::Reallocated | ReconcileOutcome::Recomputed)
    }
}

pub struct StagingRecord<P, B> {
    label: &'static str,
    committed: P,
    pending: P,
    buffers: Option<B>,
    recomputes: u64,
}

impl<P: StagedParams, B> StagingRecord<P, B> {
    pub fn new(label: &'static str, initial: P) -> Self {
        Self {
            label,
            committed: initial.clone(),
            pending: initial,
            buffers: None,
            recomputes: 0,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn committed(&self) -> &P {
        &self.committed
    }

    pub fn pending(&self) -> &P {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut P {
        &mut self.pending
    }

    pub fn buffers(&self) -> Option<&B> {
        self.buffers.as_ref()
    }

    pub fn buffers_mut(&mut self) -> Option<&mut B> {
        self.buffers.as_mut()
    }

    /// Number of successful recomputes so far.
    pub fn recomputes(&self) -> u64 {
        self.recomputes
    }

    /// Drops the buffers so the next reconcile reallocates.
    pub fn invalidate(&mut self) {
        self.buffers = None;
    }

    pub fn classify(&self, external: ExternalDirty) -> DiffClass {
        if self.buffers.is_none()
            || external.structural
            || self.committed.structural_diff(&self.pending)
        {
            DiffClass::Structural
        } else if external.parametric || self.committed.parametric_diff(&self.pending) {
            DiffClass::Parametric
        } else {
            DiffClass::Clean
        }
    }

    pub fn reconcile<A, R>(
        &mut self,
        external: ExternalDirty,
        allocate: A,
        recompute: R,
    ) -> ReconcileOutcome
    where
        A: FnOnce(&P) -> Result<B, BackendError>,
        R: FnOnce(&P, &mut B) -> Result<(), BackendError>,
    {
        let class = self.classify(external);
        let outcome = match class {
            DiffClass::Structural => {
                let mut fresh = match allocate(&self.pending) {
                    Ok(buffers) => buffers,
                    Err(err) => {
                        log::warn!("[{}] reallocation aborted: {err}", self.label);
                        return ReconcileOutcome::Aborted;
                    }
                };
                if let Err(err) = recompute(&self.pending, &mut fresh) {
                    log::warn!("[{}] recompute into new buffers failed: {err}", self.label);
                    return ReconcileOutcome::Aborted;
                }
                self.buffers = Some(fresh);
                log::info!("[{}] buffers reallocated", self.label);
                ReconcileOutcome::Reallocated
            }
            DiffClass::Parametric => self.recompute_in_place(recompute),
            DiffClass::Clean => match self.pending.policy() {
                RecomputePolicy::CacheOnEqual => return ReconcileOutcome::Skipped,
                RecomputePolicy::AlwaysRecompute | RecomputePolicy::ViewDependent => {
                    self.recompute_in_place(recompute)
                }
            },
        };

        if outcome.recomputed() {
            self.committed = self.pending.clone();
            self.recomputes += 1;
        }
        outcome
    }

    fn recompute_in_place<R>(&mut self, recompute: R) -> ReconcileOutcome
    where
        R: FnOnce(&P, &mut B) -> Result<(), BackendError>,
    {
        let Some(buffers) = self.buffers.as_mut() else {
            return ReconcileOutcome::Aborted;
        };
        match recompute(&self.pending, buffers) {
            Ok(()) => ReconcileOutcome::Recomputed,
            Err(err) => {
                log::warn!("[{}] recompute failed: {err}", self.label);
                ReconcileOutcome::Aborted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vis_api::prelude::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TrailParams {
        count: u32,
        color: f32,
        always: bool,
    }

    impl StagedParams for TrailParams {
        fn structural_diff(&self, other: &Self) -> bool {
            self.count != other.count
        }

        fn parametric_diff(&self, other: &Self) -> bool {
            self.color != other.color
        }

        fn policy(&self) -> RecomputePolicy {
            if self.always {
                RecomputePolicy::AlwaysRecompute
            } else {
                RecomputePolicy::CacheOnEqual
            }
        }
    }

    fn params() -> TrailParams {
        TrailParams {
            count: 4,
            color: 0.5,
            always: false,
        }
    }

    struct Harness {
        device: ComputeDevice,
        log: RecordingHandle,
        record: StagingRecord<TrailParams, GpuResource>,
    }

    impl Harness {
        fn new() -> Self {
            let backend = RecordingBackend::new();
            let log = backend.handle();
            Self {
                device: ComputeDevice::new(backend),
                log,
                record: StagingRecord::new("trail", params()),
            }
        }

        fn reconcile(&mut self, external: ExternalDirty) -> ReconcileOutcome {
            let device = &self.device;
            self.record.reconcile(
                external,
                |p| device.allocate(ResourceDesc::buffer("trail", p.count, 16)),
                |p, buffer| {
                    device.dispatch(
                        KernelId::ComputeStreamlines,
                        bytemuck::bytes_of(&p.color),
                        &[buffer],
                        [1, 1, 1],
                    )
                },
            )
        }

        fn handle(&self) -> Option<ResourceId> {
            self.record.buffers().map(GpuResource::id)
        }
    }

    #[test]
    fn first_reconcile_allocates() {
        let mut h = Harness::new();
        assert_eq!(h.record.classify(ExternalDirty::NONE), DiffClass::Structural);
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Reallocated);
        assert!(h.handle().is_some());
    }

    #[test]
    fn parametric_change_keeps_the_handle() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        let before = h.handle();

        h.record.pending_mut().color = 0.9;
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Recomputed);
        assert_eq!(h.handle(), before);
        assert_eq!(h.record.committed().color, 0.9);
    }

    #[test]
    fn structural_change_replaces_the_handle() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        let before = h.handle();

        h.record.pending_mut().count = 8;
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Reallocated);
        assert_ne!(h.handle(), before);
        h.device.flush_releases();
        assert_eq!(h.log.released(), before.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn external_structural_signal_reallocates() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        let before = h.handle();
        assert_eq!(
            h.reconcile(ExternalDirty::structural(true)),
            ReconcileOutcome::Reallocated
        );
        assert_ne!(h.handle(), before);
    }

    #[test]
    fn clean_record_is_a_cache_hit() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        let dispatches = h.log.dispatch_count(KernelId::ComputeStreamlines);
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Skipped);
        assert_eq!(h.log.dispatch_count(KernelId::ComputeStreamlines), dispatches);
        assert_eq!(h.record.recomputes(), 1);
    }

    #[test]
    fn always_recompute_ignores_equality() {
        let mut h = Harness::new();
        h.record.pending_mut().always = true;
        h.reconcile(ExternalDirty::NONE);
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Recomputed);
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Recomputed);
    }

    #[test]
    fn failed_allocation_keeps_committed_state() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        let before = h.handle();

        h.record.pending_mut().count = 1_000;
        h.log.fail_next_allocations(1);
        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Aborted);
        assert_eq!(h.handle(), before);
        assert_eq!(h.record.committed().count, 4);
        assert_eq!(h.record.pending().count, 1_000);

        assert_eq!(h.reconcile(ExternalDirty::NONE), ReconcileOutcome::Reallocated);
        assert_eq!(h.record.committed().count, 1_000);
    }

    #[test]
    fn structural_wins_over_parametric() {
        let mut h = Harness::new();
        h.reconcile(ExternalDirty::NONE);
        h.record.pending_mut().count = 2;
        h.record.pending_mut().color = 0.1;
        assert_eq!(
            h.record.classify(ExternalDirty::parametric(true)),
            DiffClass::Structural
        );
    }
}
