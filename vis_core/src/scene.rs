//! Frame driver.
//!
//! One `frame` call runs the whole dependency chain in order: pointer input,
//! playback, dataset slots, metric, artifacts, and finally the per-frame box
//! flags. Every consumer therefore reconciles after its upstream changed on
//! the same frame.

use crate::{
    artifact::{ParticleParams, ParticleProbe, SliceParams, SlicePlane},
    context::VisContext,
    dataset::{SlotUpdate, TimeVaryingDataset},
    manipulation::{InteractionPhase, PointerState},
    metric::{DerivedMetricDataset, MetricParams},
    playback::Playback,
    settings::{key, Persist, SettingsStore},
    staging::ReconcileOutcome,
};

/// What one frame did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// The elapsed time was out of range and nothing ran.
    pub skipped: bool,
    pub interaction: InteractionPhase,
    pub slot_update: Option<SlotUpdate>,
    pub uploads_performed: u32,
    pub uploads_avoided: u32,
    pub reallocations: u32,
    pub recomputes: u32,
    pub cache_hits: u32,
    pub aborted: u32,
}

impl FrameReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn count_slots(&mut self, update: SlotUpdate) {
        self.slot_update = Some(update);
        let (performed, avoided) = match update {
            SlotUpdate::Ignored => (0, 0),
            SlotUpdate::Unchanged => (0, 2),
            SlotUpdate::Swapped => (1, 1),
            SlotUpdate::Reloaded => (2, 0),
        };
        self.uploads_performed += performed;
        self.uploads_avoided += avoided;
    }

    fn count(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Reallocated => self.reallocations += 1,
            ReconcileOutcome::Recomputed => self.recomputes += 1,
            ReconcileOutcome::Skipped => self.cache_hits += 1,
            ReconcileOutcome::Aborted => self.aborted += 1,
        }
    }
}

pub struct Scene {
    dataset: TimeVaryingDataset,
    metric: Option<DerivedMetricDataset>,
    probes: Vec<ParticleProbe>,
    slices: Vec<SlicePlane>,
    playback: Playback,
}

/// Stored artifact count, clamped to `limit`.
fn capped_count(store: &SettingsStore, name: &str, limit: u32) -> usize {
    let stored = store.get::<u32>(name).unwrap_or(0);
    if stored > limit {
        log::warn!("{name}={stored} exceeds the limit of {limit}, loading {limit}");
    }
    stored.min(limit) as usize
}

impl Scene {
    pub fn new(ctx: &VisContext, dataset: TimeVaryingDataset) -> Self {
        Self {
            dataset,
            metric: None,
            probes: Vec::new(),
            slices: Vec::new(),
            playback: Playback::from_config(&ctx.config().playback),
        }
    }

    /// Replaces the metric; consumers re-subscribe on the next frame.
    pub fn set_metric(&mut self, params: MetricParams) -> &mut DerivedMetricDataset {
        self.metric.insert(DerivedMetricDataset::new(&self.dataset, params))
    }

    pub fn add_probe(&mut self, ctx: &mut VisContext, params: ParticleParams) -> usize {
        let seed = ctx.config().rng_seed.wrapping_add(self.probes.len() as u64);
        let (boxes, _, config) = ctx.parts_mut();
        self.probes
            .push(ParticleProbe::new(&self.dataset, boxes, config, params, seed));
        self.probes.len() - 1
    }

    pub fn add_slice(&mut self, ctx: &mut VisContext, params: SliceParams) -> usize {
        let seed = ctx.config().rng_seed.wrapping_add(0x51ce + self.slices.len() as u64);
        let (boxes, _, config) = ctx.parts_mut();
        self.slices
            .push(SlicePlane::new(&self.dataset, boxes, config, params, seed));
        self.slices.len() - 1
    }

    pub fn dataset(&self) -> &TimeVaryingDataset {
        &self.dataset
    }

    pub fn metric(&self) -> Option<&DerivedMetricDataset> {
        self.metric.as_ref()
    }

    pub fn metric_mut(&mut self) -> Option<&mut DerivedMetricDataset> {
        self.metric.as_mut()
    }

    pub fn probes(&self) -> &[ParticleProbe] {
        &self.probes
    }

    pub fn probe_mut(&mut self, index: usize) -> Option<&mut ParticleProbe> {
        self.probes.get_mut(index)
    }

    pub fn slices(&self) -> &[SlicePlane] {
        &self.slices
    }

    pub fn slice_mut(&mut self, index: usize) -> Option<&mut SlicePlane> {
        self.slices.get_mut(index)
    }

    pub fn playback(&self) -> &Playback {
        &self.playback
    }

    pub fn playback_mut(&mut self) -> &mut Playback {
        &mut self.playback
    }

    pub fn frame(&mut self, ctx: &mut VisContext, elapsed: f32, pointer: PointerState) -> FrameReport {
        if !elapsed.is_finite() || elapsed < 0.0 || elapsed > ctx.config().max_frame_elapsed {
            log::debug!("skipping frame with elapsed {elapsed}");
            return FrameReport::skipped();
        }
        let mut report = FrameReport {
            interaction: ctx.handle_pointer(pointer),
            ..FrameReport::default()
        };

        let time = self.playback.advance(elapsed, self.dataset.sequence_length());
        let device = ctx.device();
        if self.dataset.timestep_count() < 2 {
            if let Err(err) = self.dataset.make_resident(device) {
                log::warn!("dataset upload failed: {err}");
            }
        }
        match self.dataset.set_time(device, time) {
            Ok(update) => report.count_slots(update),
            Err(err) => log::warn!("set_time({time}) failed: {err}"),
        }

        let metric = self.metric.as_ref();
        for probe in &mut self.probes {
            probe.sync_subscriptions(metric);
        }
        for slice in &mut self.slices {
            slice.sync_subscriptions(&self.dataset, metric);
        }
        if let Some(metric) = self.metric.as_mut() {
            report.count(metric.update(device, &self.dataset));
        }

        let metric = self.metric.as_ref();
        for probe in &mut self.probes {
            report.count(probe.update(device, &self.dataset, metric, elapsed));
        }
        for slice in &mut self.slices {
            report.count(slice.update(device, &self.dataset, metric));
        }

        ctx.end_frame();
        report
    }

    pub fn save_settings(&self, store: &mut SettingsStore) {
        self.playback.save_settings(store, "playback");
        if let Some(metric) = &self.metric {
            metric.params().save_settings(store, "metric");
        }
        store.write("particles.count", &(self.probes.len() as u32));
        for (i, probe) in self.probes.iter().enumerate() {
            probe.save_settings(store, &format!("particles[{i}]"));
        }
        store.write("slices.count", &(self.slices.len() as u32));
        for (i, slice) in self.slices.iter().enumerate() {
            slice.save_settings(store, &format!("slice[{i}]"));
        }
    }

    /// Adds artifacts until the stored counts are met, then loads each.
    /// Artifacts beyond the stored counts are left alone.
    pub fn load_settings(&mut self, ctx: &mut VisContext, store: &SettingsStore) {
        self.playback.load_settings(store, "playback");
        if store.get_raw(&key("metric", "kind")).is_some() {
            if self.metric.is_none() {
                self.set_metric(MetricParams::default());
            }
            if let Some(metric) = self.metric.as_mut() {
                metric.params_mut().load_settings(store, "metric");
            }
        }

        let limit = ctx.config().max_artifacts;
        let probes = capped_count(store, "particles.count", limit);
        while self.probes.len() < probes {
            self.add_probe(ctx, ParticleParams::default());
        }
        for (i, probe) in self.probes.iter_mut().enumerate().take(probes) {
            probe.load_settings(store, &format!("particles[{i}]"));
        }

        let slices = capped_count(store, "slices.count", limit);
        while self.slices.len() < slices {
            self.add_slice(ctx, SliceParams::default());
        }
        for (i, slice) in self.slices.iter_mut().enumerate().take(slices) {
            slice.load_settings(store, &format!("slice[{i}]"));
        }
        log::info!("loaded settings for {probes} particle probes and {slices} slices");
    }
}
