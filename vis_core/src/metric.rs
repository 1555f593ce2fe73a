//! Scalar metrics derived from a vector dataset.
//!
//! The metric volume is only maintained while something subscribes to it.
//! A formula or range edit, or new upstream time, triggers a recompute on the
//! next `update`; subscribers are notified afterwards.

use std::sync::Arc;

use glam::UVec3;
use serde::{Deserialize, Serialize};
use vis_api::prelude::*;

use crate::{
    dataset::{reduce_min_max, TimeVaryingDataset},
    gpu_types::MetricUniform,
    named_setting,
    settings::{key, Persist, SettingsStore},
    staging::{ExternalDirty, ReconcileOutcome, StagedParams, StagingRecord},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricKind {
    #[default]
    VelocityMagnitude,
    Divergence,
    VorticityMagnitude,
    Qs,
    QOmega,
    EnstrophyProduction,
    VSquared,
    QParameter,
    Lambda2,
    FourthComponent,
}

struct MetricEntry {
    kind: MetricKind,
    name: &'static str,
    kernel: KernelId,
}

const METRICS: [MetricEntry; 10] = [
    MetricEntry { kind: MetricKind::VelocityMagnitude, name: "velocity_magnitude", kernel: KernelId::MetricVelocityMagnitude },
    MetricEntry { kind: MetricKind::Divergence, name: "divergence", kernel: KernelId::MetricDivergence },
    MetricEntry { kind: MetricKind::VorticityMagnitude, name: "vorticity_magnitude", kernel: KernelId::MetricVorticityMagnitude },
    MetricEntry { kind: MetricKind::Qs, name: "qs", kernel: KernelId::MetricQs },
    MetricEntry { kind: MetricKind::QOmega, name: "q_omega", kernel: KernelId::MetricQOmega },
    MetricEntry { kind: MetricKind::EnstrophyProduction, name: "enstrophy_production", kernel: KernelId::MetricEnstrophyProduction },
    MetricEntry { kind: MetricKind::VSquared, name: "v_squared", kernel: KernelId::MetricVSquared },
    MetricEntry { kind: MetricKind::QParameter, name: "q_parameter", kernel: KernelId::MetricQParameter },
    MetricEntry { kind: MetricKind::Lambda2, name: "lambda2", kernel: KernelId::MetricLambda2 },
    MetricEntry { kind: MetricKind::FourthComponent, name: "fourth_component", kernel: KernelId::MetricFourthComponent },
];

impl MetricKind {
    pub fn all() -> impl Iterator<Item = MetricKind> {
        METRICS.iter().map(|entry| entry.kind)
    }

    fn entry(self) -> &'static MetricEntry {
        &METRICS[self as usize]
    }

    pub fn kernel(self) -> KernelId {
        self.entry().kernel
    }

    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        METRICS.iter().find(|entry| entry.name == name).map(|entry| entry.kind)
    }
}

named_setting!(MetricKind);

/// Normalisation range; `reverse` maps `max` to 0 and `min` to 1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRange {
    pub min: f32,
    pub max: f32,
    pub reverse: bool,
}

impl Default for MetricRange {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 1.0,
            reverse: false,
        }
    }
}

impl MetricRange {
    /// `(lo, hi)` after applying `reverse`.
    pub fn effective(&self) -> (f32, f32) {
        if self.reverse {
            (self.max, self.min)
        } else {
            (self.min, self.max)
        }
    }

    pub fn span(&self) -> f32 {
        let (lo, hi) = self.effective();
        hi - lo
    }

    pub fn normalize(&self, value: f32) -> f32 {
        let (lo, _) = self.effective();
        let span = self.span();
        if span == 0.0 {
            0.0
        } else {
            (value - lo) / span
        }
    }

    pub fn denormalize(&self, value: f32) -> f32 {
        let (lo, _) = self.effective();
        lo + value * self.span()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricParams {
    pub kind: MetricKind,
    pub range: MetricRange,
    pub boundary_fixed: bool,
    pub boundary_value: f32,
}

impl Default for MetricParams {
    fn default() -> Self {
        Self {
            kind: MetricKind::VelocityMagnitude,
            range: MetricRange::default(),
            boundary_fixed: false,
            boundary_value: 0.0,
        }
    }
}

impl StagedParams for MetricParams {
    fn structural_diff(&self, _other: &Self) -> bool {
        false
    }

    fn parametric_diff(&self, other: &Self) -> bool {
        self != other
    }
}

impl Persist for MetricParams {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        store.write(key(prefix, "kind"), &self.kind);
        store.write(key(prefix, "min"), &self.range.min);
        store.write(key(prefix, "max"), &self.range.max);
        store.write(key(prefix, "reverse"), &self.range.reverse);
        store.write(key(prefix, "boundary_fixed"), &self.boundary_fixed);
        store.write(key(prefix, "boundary_value"), &self.boundary_value);
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        store.read(&key(prefix, "kind"), &mut self.kind);
        store.read(&key(prefix, "min"), &mut self.range.min);
        store.read(&key(prefix, "max"), &mut self.range.max);
        store.read(&key(prefix, "reverse"), &mut self.range.reverse);
        store.read(&key(prefix, "boundary_fixed"), &mut self.boundary_fixed);
        store.read(&key(prefix, "boundary_value"), &mut self.boundary_value);
    }
}

impl MetricParams {
    fn uniform(&self, resolution: UVec3, components: u32, timestep_t: f32) -> MetricUniform {
        let (lo, hi) = self.range.effective();
        let span = self.range.span();
        MetricUniform {
            resolution: resolution.to_array(),
            components,
            range_lo: lo,
            range_hi: hi,
            inv_span: if span == 0.0 { 0.0 } else { 1.0 / span },
            timestep_t,
            boundary_fixed: self.boundary_fixed as u32,
            boundary_value: self.range.normalize(self.boundary_value),
            _pad: [0; 2],
        }
    }
}

pub struct DerivedMetricDataset {
    record: StagingRecord<MetricParams, GpuResource>,
    upstream: Arc<StaleFlag>,
    resolution: UVec3,
    min_max_grid: Option<GpuResource>,
    notifier: ChangeNotifier,
}

impl Notifiable for DerivedMetricDataset {
    fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

impl DerivedMetricDataset {
    pub fn new(upstream: &TimeVaryingDataset, mut params: MetricParams) -> Self {
        if params.range.min == params.range.max {
            params.range.min = 0.0;
            params.range.max = 1.0;
        }
        let flag = StaleFlag::new();
        upstream.register(&flag);
        Self {
            record: StagingRecord::new("metric", params),
            upstream: flag,
            resolution: upstream.resolution(),
            min_max_grid: None,
            notifier: ChangeNotifier::new(),
        }
    }

    /// Editable parameters; applied on the next `update`.
    pub fn params_mut(&mut self) -> &mut MetricParams {
        self.record.pending_mut()
    }

    pub fn params(&self) -> &MetricParams {
        self.record.pending()
    }

    pub fn committed(&self) -> &MetricParams {
        self.record.committed()
    }

    pub fn output(&self) -> Option<&GpuResource> {
        self.record.buffers()
    }

    pub fn recomputes(&self) -> u64 {
        self.record.recomputes()
    }

    /// Call after the upstream `set_time` of the same frame.
    pub fn update(&mut self, device: &ComputeDevice, upstream: &TimeVaryingDataset) -> ReconcileOutcome {
        if !self.notifier.has_observers() {
            return ReconcileOutcome::Skipped;
        }
        let (Some(slot0), Some(slot1)) = (upstream.slot0(), upstream.slot1()) else {
            return ReconcileOutcome::Skipped;
        };

        if upstream.resolution() != self.resolution {
            self.resolution = upstream.resolution();
            self.record.invalidate();
        }
        let upstream_stale = self.upstream.take();
        let resolution = self.resolution;
        let components = upstream.format().gpu_components();
        let timestep_t = upstream.timestep_t();

        let outcome = self.record.reconcile(
            ExternalDirty::parametric(upstream_stale),
            |_| {
                device.allocate(ResourceDesc::volume(
                    "metric::volume",
                    resolution.to_array(),
                    4,
                ))
            },
            |params, out| {
                let uniform = params.uniform(resolution, components, timestep_t);
                device.dispatch(
                    params.kind.kernel(),
                    bytemuck::bytes_of(&uniform),
                    &[slot0, slot1, out],
                    workgroups_for(resolution.to_array(), [32, 2, 2]),
                )
            },
        );

        match outcome {
            ReconcileOutcome::Aborted if upstream_stale => self.upstream.mark(),
            outcome if outcome.recomputed() => {
                log::debug!("metric {} recomputed", self.committed().kind.name());
                self.notifier.notify_all();
            }
            _ => {}
        }
        outcome
    }

    /// Sets the pending range to the actual extent of the current output.
    /// Non-finite results leave the range alone. Blocks on a readback.
    pub fn fit_range(&mut self, device: &ComputeDevice) -> Result<Option<(f32, f32)>, BackendError> {
        let Some(output) = self.record.buffers() else {
            return Ok(None);
        };
        let normalized = reduce_min_max(device, output, &mut self.min_max_grid, self.resolution, 1)?;
        let Some((a, b)) = normalized else {
            return Ok(None);
        };
        let committed = self.record.committed().range;
        let (a, b) = (committed.denormalize(a), committed.denormalize(b));
        if !(a.is_finite() && b.is_finite()) {
            return Ok(None);
        }
        let (min, max) = (a.min(b), a.max(b));
        let range = &mut self.record.pending_mut().range;
        range.min = min;
        range.max = max;
        Ok(Some((min, max)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DataFormat, VolumeDesc};
    use glam::Vec3;

    fn upstream() -> TimeVaryingDataset {
        let desc = VolumeDesc {
            resolution: UVec3::new(4, 2, 2),
            slice_thickness: Vec3::ONE,
            format: DataFormat::Float4,
            dt: 1.0,
        };
        let bytes = desc.voxel_count() * 16;
        TimeVaryingDataset::new(desc, vec![vec![0; bytes]; 3]).expect("dataset")
    }

    fn device() -> (ComputeDevice, RecordingHandle) {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        (ComputeDevice::new(backend), log)
    }

    #[test]
    fn every_kind_has_a_distinct_kernel_and_name() {
        let kinds: Vec<_> = MetricKind::all().collect();
        assert_eq!(kinds.len(), 10);
        for (i, kind) in kinds.iter().enumerate() {
            assert_eq!(MetricKind::from_name(kind.name()), Some(*kind));
            for other in &kinds[i + 1..] {
                assert_ne!(kind.kernel(), other.kernel());
            }
        }
    }

    #[test]
    fn reverse_swaps_the_range() {
        let range = MetricRange {
            min: 2.0,
            max: 6.0,
            reverse: true,
        };
        assert_eq!(range.effective(), (6.0, 2.0));
        assert_eq!(range.span(), -4.0);
        assert_eq!(range.normalize(3.0), 0.75);
        assert_eq!(range.denormalize(0.75), 3.0);
    }

    #[test]
    fn degenerate_range_defaults_to_unit() {
        let data = upstream();
        let params = MetricParams {
            range: MetricRange {
                min: 3.0,
                max: 3.0,
                reverse: false,
            },
            ..MetricParams::default()
        };
        let metric = DerivedMetricDataset::new(&data, params);
        assert_eq!(metric.params().range, MetricRange::default());
    }

    #[test]
    fn unobserved_metric_does_nothing() {
        let (device, log) = device();
        let mut data = upstream();
        let mut metric = DerivedMetricDataset::new(&data, MetricParams::default());
        data.set_time(&device, 0.5).expect("set");
        log.clear_calls();

        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Skipped);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn observed_metric_follows_time_and_edits() {
        let (device, log) = device();
        let mut data = upstream();
        let mut metric = DerivedMetricDataset::new(&data, MetricParams::default());
        let listener = StaleFlag::new();
        metric.register(&listener);

        data.set_time(&device, 0.5).expect("set");
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Reallocated);
        assert!(listener.take());
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Skipped);
        assert!(!listener.take());

        data.set_time(&device, 0.6).expect("set");
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Recomputed);

        metric.params_mut().kind = MetricKind::Lambda2;
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Recomputed);
        assert_eq!(log.dispatch_count(KernelId::MetricLambda2), 1);
        assert_eq!(log.dispatch_count(KernelId::MetricVelocityMagnitude), 2);
    }

    #[test]
    fn time_advanced_while_unobserved_is_not_lost() {
        let (device, _log) = device();
        let mut data = upstream();
        let mut metric = DerivedMetricDataset::new(&data, MetricParams::default());
        let listener = StaleFlag::new();
        metric.register(&listener);
        data.set_time(&device, 0.5).expect("set");
        metric.update(&device, &data);

        metric.unregister(&listener);
        data.set_time(&device, 0.7).expect("set");
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Skipped);

        metric.register(&listener);
        assert_eq!(metric.update(&device, &data), ReconcileOutcome::Recomputed);
    }

    #[test]
    fn uniform_carries_normalised_boundary() {
        let (device, log) = device();
        let mut data = upstream();
        let mut metric = DerivedMetricDataset::new(
            &data,
            MetricParams {
                range: MetricRange {
                    min: 0.0,
                    max: 4.0,
                    reverse: false,
                },
                boundary_fixed: true,
                boundary_value: 1.0,
                ..MetricParams::default()
            },
        );
        let listener = StaleFlag::new();
        metric.register(&listener);
        data.set_time(&device, 0.25).expect("set");
        metric.update(&device, &data);

        let params = log
            .last_params(KernelId::MetricVelocityMagnitude)
            .expect("params");
        let uniform: MetricUniform = bytemuck::pod_read_unaligned(&params);
        assert_eq!(uniform.boundary_fixed, 1);
        assert_eq!(uniform.boundary_value, 0.25);
        assert_eq!(uniform.inv_span, 0.25);
        assert_eq!(uniform.timestep_t, 0.25);
    }

    #[test]
    fn fit_range_adopts_finite_results_only() {
        let rows = Arc::new(std::sync::Mutex::new(vec![0.25f32, 0.5, 0.0, 1.0, 0.1, 0.2, 0.3, 0.4]));
        let shared = Arc::clone(&rows);
        let backend = RecordingBackend::new().with_hook(KernelId::MinMaxRows, move |dispatch, contents| {
            let values = shared.lock().map(|v| v.clone()).unwrap_or_default();
            if let Some(grid) = contents.get_mut(dispatch.resources[1]) {
                grid.copy_from_slice(bytemuck::cast_slice(&values));
            }
        });
        let device = ComputeDevice::new(backend);
        let mut data = upstream();
        let mut metric = DerivedMetricDataset::new(
            &data,
            MetricParams {
                range: MetricRange {
                    min: 0.0,
                    max: 10.0,
                    reverse: false,
                },
                ..MetricParams::default()
            },
        );
        let listener = StaleFlag::new();
        metric.register(&listener);
        data.set_time(&device, 0.0).expect("set");
        metric.update(&device, &data);

        assert_eq!(metric.fit_range(&device).expect("fit"), Some((0.0, 10.0)));
        *rows.lock().expect("lock") = vec![f32::NAN; 8];
        assert_eq!(metric.fit_range(&device).expect("fit"), None);
        assert_eq!(metric.params().range.max, 10.0);
    }

    #[test]
    fn params_persist_by_name() {
        let mut store = SettingsStore::new();
        let params = MetricParams {
            kind: MetricKind::QOmega,
            range: MetricRange {
                min: -1.0,
                max: 2.0,
                reverse: true,
            },
            boundary_fixed: true,
            boundary_value: 0.5,
        };
        params.save_settings(&mut store, "metric");
        assert_eq!(store.get_raw("metric.kind"), Some("q_omega"));

        let mut loaded = MetricParams::default();
        loaded.load_settings(&store, "metric");
        assert_eq!(loaded, params);
    }
}
