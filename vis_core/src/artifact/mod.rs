//! Derived visual artifacts driven by a staging record.

pub mod particle;
pub mod slice;

use std::sync::Arc;

use vis_api::notify::{Notifiable, SourceId, StaleFlag};

pub use particle::{LineMode, ParticleParams, ParticleProbe, RenderMode, RibbonOrientation, SeedingMode};
pub use slice::{NoiseType, SliceDirection, SlicePass, SliceParams, SlicePlane};

/// A stale flag that joins or leaves a source at runtime, e.g. when an
/// artifact starts or stops sampling the metric volume.
pub struct Subscription {
    flag: Arc<StaleFlag>,
    following: Option<SourceId>,
}

impl Default for Subscription {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    pub fn new() -> Self {
        Self {
            flag: StaleFlag::new(),
            following: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.following.is_some()
    }

    /// Returns whether the subscription state changed. Joining marks the flag
    /// so the first frame after it samples fresh data. A replaced source is
    /// joined afresh.
    pub fn follow<N: Notifiable>(&mut self, source: &N, wanted: bool) -> bool {
        let id = source.notifier().source();
        let target = wanted.then_some(id);
        if target == self.following {
            return false;
        }
        if wanted {
            source.register(&self.flag);
            self.flag.mark();
        } else {
            source.unregister(&self.flag);
            self.flag.take();
        }
        self.following = target;
        true
    }

    pub fn take(&self) -> bool {
        self.is_active() && self.flag.take()
    }

    pub fn mark(&self) {
        self.flag.mark();
    }
}
