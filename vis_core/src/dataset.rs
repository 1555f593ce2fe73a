//! Time-varying volume data with two resident slots.
//!
//! Only the two timesteps bracketing the playback time live on the backend.
//! Moving forward by one timestep swaps the slot handles and uploads the one
//! new timestep; anything else uploads both. Scalar datasets also keep an
//! interpolated volume between the two slots.

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vis_api::prelude::*;

use crate::gpu_types::{InterpolateUniform, MinMaxUniform};

pub const HISTOGRAM_BINS: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    Byte,
    Half,
    Half2,
    Half3,
    Half4,
    Float,
    Float2,
    Float3,
    Float4,
}

impl DataFormat {
    pub const fn components(self) -> u32 {
        match self {
            DataFormat::Byte | DataFormat::Half | DataFormat::Float => 1,
            DataFormat::Half2 | DataFormat::Float2 => 2,
            DataFormat::Half3 | DataFormat::Float3 => 3,
            DataFormat::Half4 | DataFormat::Float4 => 4,
        }
    }

    pub const fn component_size(self) -> u32 {
        match self {
            DataFormat::Byte => 1,
            DataFormat::Half | DataFormat::Half2 | DataFormat::Half3 | DataFormat::Half4 => 2,
            _ => 4,
        }
    }

    /// Three-component data is padded to four on upload.
    pub const fn gpu_components(self) -> u32 {
        match self.components() {
            3 => 4,
            n => n,
        }
    }

    pub const fn element_size(self) -> u32 {
        self.components() * self.component_size()
    }

    pub const fn gpu_element_size(self) -> u32 {
        self.gpu_components() * self.component_size()
    }

    pub const fn is_vector(self) -> bool {
        self.components() > 1
    }

    fn pad(self, raw: &[u8]) -> Vec<u8> {
        if self.components() == self.gpu_components() {
            return raw.to_vec();
        }
        let element = self.element_size() as usize;
        let padding = self.gpu_element_size() as usize - element;
        let mut out = Vec::with_capacity(raw.len() / element * (element + padding));
        for chunk in raw.chunks_exact(element) {
            out.extend_from_slice(chunk);
            out.extend(std::iter::repeat(0u8).take(padding));
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VolumeDesc {
    pub resolution: UVec3,
    pub slice_thickness: Vec3,
    pub format: DataFormat,
    /// Seconds between timesteps.
    pub dt: f32,
}

impl VolumeDesc {
    pub fn voxel_count(&self) -> usize {
        (self.resolution.x * self.resolution.y * self.resolution.z) as usize
    }
}

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("resolution {0} has a zero extent")]
    EmptyResolution(UVec3),
    #[error("dt must be positive and finite, got {0}")]
    InvalidDt(f32),
    #[error("timestep {index} holds {actual} bytes, expected {expected}")]
    TimestepSize {
        index: usize,
        actual: usize,
        expected: usize,
    },
    #[error("got {actual} histograms for {expected} timesteps")]
    HistogramCount { actual: usize, expected: usize },
    #[error("histogram of timestep {index} has {bins} bins, expected 256")]
    HistogramBins { index: usize, bins: usize },
}

/// What a `set_time` call did to the slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotUpdate {
    /// Single timestep, empty sequence or invalid time.
    Ignored,
    /// Bracket unchanged, no uploads.
    Unchanged,
    /// Slots swapped, one upload.
    Swapped,
    /// Both slots uploaded.
    Reloaded,
}

struct Timestep {
    bytes: Vec<u8>,
    histogram: Option<Vec<f32>>,
}

/// `(idx0, frac)` for time `t`. `frac` is the position inside the current
/// `dt` interval, 0 before the start and 1 at or after the sequence end.
pub fn bracket(t: f32, dt: f32, timestep_count: usize) -> (usize, f32) {
    let last_pair = timestep_count.saturating_sub(2);
    let steps = t / dt;
    let idx0 = (steps.floor().max(0.0) as usize).min(last_pair);
    let frac = if steps <= 0.0 {
        0.0
    } else if steps >= timestep_count as f32 {
        1.0
    } else {
        (steps - steps.floor()).clamp(0.0, 1.0)
    };
    (idx0, frac)
}

pub fn blend_histograms(h0: &[f32], h1: &[f32], frac: f32, out: &mut Vec<f32>) {
    out.clear();
    out.extend(
        h0.iter()
            .zip(h1)
            .map(|(a, b)| (1.0 - frac) * a + frac * b),
    );
}

fn byte_histogram(bytes: &[u8]) -> Vec<f32> {
    let mut bins = vec![0f32; HISTOGRAM_BINS];
    for &b in bytes {
        bins[b as usize] += 1.0;
    }
    let total = bytes.len().max(1) as f32;
    bins.iter_mut().for_each(|bin| *bin /= total);
    bins
}

/// Folds a grid of `(min, max)` pairs, skipping non-finite entries.
pub fn fold_min_max(pairs: &[f32]) -> Option<(f32, f32)> {
    pairs
        .chunks_exact(2)
        .filter(|pair| pair[0].is_finite() && pair[1].is_finite())
        .fold(None, |acc, pair| match acc {
            None => Some((pair[0], pair[1])),
            Some((lo, hi)) => Some((lo.min(pair[0]), hi.max(pair[1]))),
        })
}

/// Two-phase min/max: one pair per (y, z) row on the backend, folded here.
/// Blocks on the readback.
pub fn reduce_min_max(
    device: &ComputeDevice,
    source: &GpuResource,
    grid: &mut Option<GpuResource>,
    resolution: UVec3,
    components: u32,
) -> Result<Option<(f32, f32)>, BackendError> {
    if grid.is_none() {
        *grid = Some(device.allocate(ResourceDesc::grid(
            "dataset::min_max_rows",
            resolution.y,
            resolution.z,
            8,
        ))?);
    }
    let Some(grid) = grid.as_ref() else {
        return Ok(None);
    };
    let uniform = MinMaxUniform {
        resolution: resolution.to_array(),
        components,
    };
    device.dispatch(
        KernelId::MinMaxRows,
        bytemuck::bytes_of(&uniform),
        &[source, grid],
        [1, resolution.y, resolution.z],
    )?;
    let bytes = device.read_back(grid)?;
    Ok(fold_min_max(&read_f32s(&bytes)))
}

pub struct TimeVaryingDataset {
    desc: VolumeDesc,
    timesteps: Vec<Timestep>,
    slots: [Option<GpuResource>; 2],
    slot_indices: Option<(usize, usize)>,
    current_time: f32,
    timestep_t: f32,
    time_advanced: bool,
    combined_histogram: Vec<f32>,
    interpolated: Option<GpuResource>,
    min_max_grid: Option<GpuResource>,
    notifier: ChangeNotifier,
}

impl Notifiable for TimeVaryingDataset {
    fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }
}

impl TimeVaryingDataset {
    /// `timesteps` hold tightly packed elements in `desc.format`.
    pub fn new(desc: VolumeDesc, timesteps: Vec<Vec<u8>>) -> Result<Self, DatasetError> {
        if desc.resolution.min_element() == 0 {
            return Err(DatasetError::EmptyResolution(desc.resolution));
        }
        if !(desc.dt.is_finite() && desc.dt > 0.0) {
            return Err(DatasetError::InvalidDt(desc.dt));
        }
        let expected = desc.voxel_count() * desc.format.element_size() as usize;
        let timesteps = timesteps
            .into_iter()
            .enumerate()
            .map(|(index, raw)| {
                if raw.len() != expected {
                    return Err(DatasetError::TimestepSize {
                        index,
                        actual: raw.len(),
                        expected,
                    });
                }
                let histogram = (desc.format == DataFormat::Byte).then(|| byte_histogram(&raw));
                Ok(Timestep {
                    bytes: desc.format.pad(&raw),
                    histogram,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::debug!(
            "dataset {:?} {:?} with {} timesteps",
            desc.resolution,
            desc.format,
            timesteps.len()
        );
        Ok(Self {
            desc,
            timesteps,
            slots: [None, None],
            slot_indices: None,
            current_time: 0.0,
            timestep_t: 0.0,
            time_advanced: false,
            combined_histogram: Vec::new(),
            interpolated: None,
            min_max_grid: None,
            notifier: ChangeNotifier::new(),
        })
    }

    /// Replaces the per-timestep histograms.
    pub fn with_histograms(mut self, histograms: Vec<Vec<f32>>) -> Result<Self, DatasetError> {
        if histograms.len() != self.timesteps.len() {
            return Err(DatasetError::HistogramCount {
                actual: histograms.len(),
                expected: self.timesteps.len(),
            });
        }
        for (index, (timestep, histogram)) in
            self.timesteps.iter_mut().zip(histograms).enumerate()
        {
            if histogram.len() != HISTOGRAM_BINS {
                return Err(DatasetError::HistogramBins {
                    index,
                    bins: histogram.len(),
                });
            }
            timestep.histogram = Some(histogram);
        }
        Ok(self)
    }

    pub fn desc(&self) -> &VolumeDesc {
        &self.desc
    }

    pub fn resolution(&self) -> UVec3 {
        self.desc.resolution
    }

    pub fn format(&self) -> DataFormat {
        self.desc.format
    }

    pub fn dt(&self) -> f32 {
        self.desc.dt
    }

    pub fn timestep_count(&self) -> usize {
        self.timesteps.len()
    }

    pub fn sequence_length(&self) -> f32 {
        self.desc.dt * self.timesteps.len() as f32
    }

    pub fn current_time(&self) -> f32 {
        self.current_time
    }

    /// Interpolation weight of slot1.
    pub fn timestep_t(&self) -> f32 {
        self.timestep_t
    }

    /// Whether the last `set_time` moved the playback time or the slots.
    pub fn time_advanced(&self) -> bool {
        self.time_advanced
    }

    pub fn slot_indices(&self) -> Option<(usize, usize)> {
        self.slot_indices
    }

    pub fn slot0(&self) -> Option<&GpuResource> {
        self.slots[0].as_ref()
    }

    pub fn slot1(&self) -> Option<&GpuResource> {
        self.slots[1].as_ref()
    }

    /// The volume consumers should sample: the interpolated output for scalar
    /// data, slot0 otherwise.
    pub fn current_volume(&self) -> Option<&GpuResource> {
        self.interpolated.as_ref().or(self.slots[0].as_ref())
    }

    pub fn histogram(&self, timestep: usize) -> Option<&[f32]> {
        self.timesteps.get(timestep)?.histogram.as_deref()
    }

    pub fn combined_histogram(&self) -> &[f32] {
        &self.combined_histogram
    }

    /// World extent normalised so its largest edge is 1.
    pub fn bounding_box(&self) -> Vec3 {
        let extent = self.desc.resolution.as_vec3() * self.desc.slice_thickness;
        let largest = extent.max_element();
        if largest > 0.0 {
            extent / largest
        } else {
            Vec3::ONE
        }
    }

    /// Uploads timestep 0 when nothing is resident yet. Needed for datasets
    /// with a single timestep, for which `set_time` does nothing.
    pub fn make_resident(&mut self, device: &ComputeDevice) -> Result<(), BackendError> {
        if self.slot_indices.is_some() || self.timesteps.is_empty() {
            return Ok(());
        }
        self.ensure_slots(device)?;
        let second = 1.min(self.timesteps.len() - 1);
        self.upload(device, 0, 0)?;
        self.upload(device, 1, second)?;
        self.slot_indices = Some((0, second));
        self.after_slot_change(device, 0.0)
    }

    pub fn set_time(&mut self, device: &ComputeDevice, t: f32) -> Result<SlotUpdate, BackendError> {
        if !t.is_finite() || t < 0.0 {
            log::warn!("ignoring playback time {t}");
            return Ok(SlotUpdate::Ignored);
        }
        let count = self.timesteps.len();
        if count < 2 || self.sequence_length() <= 0.0 {
            self.current_time = t;
            self.time_advanced = false;
            return Ok(SlotUpdate::Ignored);
        }

        let (idx0, frac) = bracket(t, self.desc.dt, count);
        let wanted = (idx0, idx0 + 1);
        let update = match self.slot_indices {
            Some(current) if current == wanted && self.slots_allocated() => SlotUpdate::Unchanged,
            Some((_, slot1)) if slot1 == idx0 && self.slots_allocated() => {
                self.slots.swap(0, 1);
                self.slot_indices = None;
                self.upload(device, 1, wanted.1)?;
                log::debug!("slots swapped to {wanted:?}");
                SlotUpdate::Swapped
            }
            _ => {
                self.slot_indices = None;
                self.ensure_slots(device)?;
                self.upload(device, 0, wanted.0)?;
                self.upload(device, 1, wanted.1)?;
                log::debug!("slots reloaded to {wanted:?}");
                SlotUpdate::Reloaded
            }
        };
        self.slot_indices = Some(wanted);

        let moved = t != self.current_time || frac != self.timestep_t;
        self.current_time = t;
        self.time_advanced = moved || update != SlotUpdate::Unchanged;
        if self.time_advanced {
            self.after_slot_change(device, frac)?;
            self.notifier.notify_all();
        }
        Ok(update)
    }

    /// Blocking min/max over the current volume. Keep off the per-frame path.
    pub fn min_max(&mut self, device: &ComputeDevice) -> Result<Option<(f32, f32)>, BackendError> {
        let Some(source) = self.interpolated.as_ref().or(self.slots[0].as_ref()) else {
            return Ok(None);
        };
        reduce_min_max(
            device,
            source,
            &mut self.min_max_grid,
            self.desc.resolution,
            self.desc.format.gpu_components(),
        )
    }

    fn slots_allocated(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn ensure_slots(&mut self, device: &ComputeDevice) -> Result<(), BackendError> {
        for slot in self.slots.iter_mut().filter(|slot| slot.is_none()) {
            *slot = Some(device.allocate(ResourceDesc::volume(
                "dataset::slot",
                self.desc.resolution.to_array(),
                self.desc.format.gpu_element_size(),
            ))?);
        }
        Ok(())
    }

    fn upload(&self, device: &ComputeDevice, slot: usize, timestep: usize) -> Result<(), BackendError> {
        match (self.slots[slot].as_ref(), self.timesteps.get(timestep)) {
            (Some(resource), Some(data)) => device.upload_slot(resource, timestep, &data.bytes),
            _ => Ok(()),
        }
    }

    fn after_slot_change(&mut self, device: &ComputeDevice, frac: f32) -> Result<(), BackendError> {
        self.timestep_t = frac;
        if let Some((i0, i1)) = self.slot_indices {
            let histograms = (
                self.timesteps[i0].histogram.as_deref(),
                self.timesteps[i1].histogram.as_deref(),
            );
            if let (Some(h0), Some(h1)) = histograms {
                blend_histograms(h0, h1, frac, &mut self.combined_histogram);
            }
        }
        if !self.desc.format.is_vector() {
            self.interpolate(device)?;
        }
        Ok(())
    }

    fn interpolate(&mut self, device: &ComputeDevice) -> Result<(), BackendError> {
        if self.interpolated.is_none() {
            self.interpolated = Some(device.allocate(ResourceDesc::volume(
                "dataset::interpolated",
                self.desc.resolution.to_array(),
                4,
            ))?);
        }
        let (Some(s0), Some(s1), Some(out)) = (
            self.slots[0].as_ref(),
            self.slots[1].as_ref(),
            self.interpolated.as_ref(),
        ) else {
            return Ok(());
        };
        let uniform = InterpolateUniform {
            resolution: self.desc.resolution.to_array(),
            components: self.desc.format.gpu_components(),
            timestep_t: self.timestep_t,
            _pad: [0.0; 3],
        };
        let voxels = self.desc.voxel_count() as u32;
        device.dispatch(
            KernelId::InterpolateTimesteps,
            bytemuck::bytes_of(&uniform),
            &[s0, s1, out],
            workgroups_for([voxels, 1, 1], [64, 1, 1]),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vis_api::recording::BackendCall;

    fn float_desc(format: DataFormat, res: u32) -> VolumeDesc {
        VolumeDesc {
            resolution: UVec3::splat(res),
            slice_thickness: Vec3::ONE,
            format,
            dt: 1.0,
        }
    }

    fn vector_dataset(count: usize) -> TimeVaryingDataset {
        let desc = float_desc(DataFormat::Float4, 2);
        let bytes = desc.voxel_count() * 16;
        let steps = (0..count).map(|i| vec![i as u8; bytes]).collect();
        TimeVaryingDataset::new(desc, steps).expect("dataset")
    }

    fn recording() -> (ComputeDevice, RecordingHandle) {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        (ComputeDevice::new(backend), log)
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn bracket_clamps_to_last_pair() {
        assert_eq!(bracket(0.3, 1.0, 4).0, 0);
        assert!(close(bracket(0.3, 1.0, 4).1, 0.3));
        assert_eq!(bracket(1.7, 1.0, 4).0, 1);
        assert!(close(bracket(1.7, 1.0, 4).1, 0.7));
        assert_eq!(bracket(0.0, 0.5, 4), (0, 0.0));
        assert_eq!(bracket(4.0, 1.0, 4), (2, 1.0));
        assert_eq!(bracket(7.5, 1.0, 4), (2, 1.0));
    }

    #[test]
    fn last_interval_keeps_its_fraction() {
        let (idx0, frac) = bracket(3.5, 1.0, 4);
        assert_eq!(idx0, 2);
        assert!(close(frac, 0.5));
        let (idx0, frac) = bracket(3.9, 1.0, 4);
        assert_eq!(idx0, 2);
        assert!(close(frac, 0.9));
    }

    #[test]
    fn repeated_time_issues_no_uploads() {
        let (device, log) = recording();
        let mut data = vector_dataset(4);
        assert_eq!(data.set_time(&device, 0.3).expect("set"), SlotUpdate::Reloaded);
        let uploads = log.slot_uploads().len();
        assert_eq!(data.set_time(&device, 0.3).expect("set"), SlotUpdate::Unchanged);
        assert_eq!(log.slot_uploads().len(), uploads);
        assert!(!data.time_advanced());
    }

    #[test]
    fn forward_step_swaps_slots() {
        let (device, log) = recording();
        let mut data = vector_dataset(4);
        data.set_time(&device, 0.3).expect("set");
        let old_slot1 = data.slot1().map(GpuResource::id);
        log.clear_calls();

        assert_eq!(data.set_time(&device, 1.7).expect("set"), SlotUpdate::Swapped);
        assert_eq!(data.slot0().map(GpuResource::id), old_slot1);
        assert_eq!(data.slot_indices(), Some((1, 2)));
        assert!(close(data.timestep_t(), 0.7));

        let uploads = log.slot_uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].1, 2);
        assert_eq!(Some(uploads[0].0), data.slot1().map(GpuResource::id));
    }

    #[test]
    fn jump_reloads_both_without_reallocating() {
        let (device, log) = recording();
        let mut data = vector_dataset(4);
        data.set_time(&device, 0.3).expect("set");
        log.clear_calls();

        assert_eq!(data.set_time(&device, 3.9).expect("set"), SlotUpdate::Reloaded);
        assert_eq!(data.slot_indices(), Some((2, 3)));
        assert!((0.0..=1.0).contains(&data.timestep_t()));
        let timesteps: Vec<usize> = log.slot_uploads().iter().map(|u| u.1).collect();
        assert_eq!(timesteps, vec![2, 3]);
        assert!(!log
            .calls()
            .iter()
            .any(|c| matches!(c, BackendCall::Allocate { .. })));
    }

    #[test]
    fn single_timestep_is_a_no_op() {
        let (device, log) = recording();
        let mut data = vector_dataset(1);
        assert_eq!(data.set_time(&device, 2.0).expect("set"), SlotUpdate::Ignored);
        assert!(log.calls().is_empty());
        data.make_resident(&device).expect("resident");
        assert_eq!(log.slot_uploads().len(), 2);
        assert_eq!(data.slot_indices(), Some((0, 0)));
    }

    #[test]
    fn empty_sequence_is_a_no_op() {
        let (device, log) = recording();
        let mut data = vector_dataset(0);
        assert_eq!(data.sequence_length(), 0.0);
        assert_eq!(data.set_time(&device, 1.0).expect("set"), SlotUpdate::Ignored);
        data.make_resident(&device).expect("resident");
        assert!(log.calls().is_empty());
    }

    #[test]
    fn negative_time_is_ignored() {
        let (device, _log) = recording();
        let mut data = vector_dataset(4);
        assert_eq!(data.set_time(&device, -1.0).expect("set"), SlotUpdate::Ignored);
        assert_eq!(data.slot_indices(), None);
    }

    #[test]
    fn subscribers_hear_about_time_within_a_bracket() {
        let (device, _log) = recording();
        let mut data = vector_dataset(4);
        let flag = StaleFlag::new();
        data.register(&flag);

        data.set_time(&device, 0.2).expect("set");
        assert!(flag.take());
        data.set_time(&device, 0.4).expect("set");
        assert!(flag.take());
        data.set_time(&device, 0.4).expect("set");
        assert!(!flag.take());
    }

    #[test]
    fn histogram_blend_is_linear() {
        let desc = float_desc(DataFormat::Byte, 2);
        let steps = vec![vec![0u8; 8], vec![255u8; 8], vec![0u8; 8]];
        let (device, _log) = recording();
        let mut data = TimeVaryingDataset::new(desc, steps).expect("dataset");
        data.set_time(&device, 0.25).expect("set");

        let (h0, h1) = (data.histogram(0).expect("h0"), data.histogram(1).expect("h1"));
        let combined = data.combined_histogram();
        assert_eq!(combined.len(), HISTOGRAM_BINS);
        for i in 0..HISTOGRAM_BINS {
            assert!(close(combined[i], 0.75 * h0[i] + 0.25 * h1[i]));
        }
        assert!(close(combined[0], 0.75));
        assert!(close(combined[255], 0.25));
    }

    #[test]
    fn scalar_data_is_interpolated_on_the_backend() {
        let (device, log) = recording();
        let desc = float_desc(DataFormat::Float, 2);
        let steps = vec![vec![0u8; 32]; 3];
        let mut data = TimeVaryingDataset::new(desc, steps).expect("dataset");
        data.set_time(&device, 0.5).expect("set");
        assert_eq!(log.dispatch_count(KernelId::InterpolateTimesteps), 1);
        let params = log.last_params(KernelId::InterpolateTimesteps).expect("params");
        let uniform: InterpolateUniform = bytemuck::pod_read_unaligned(&params);
        assert!(close(uniform.timestep_t, 0.5));
        assert_ne!(data.current_volume().map(GpuResource::id), data.slot0().map(GpuResource::id));
    }

    #[test]
    fn three_component_data_is_padded() {
        let desc = float_desc(DataFormat::Float3, 1);
        let raw: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0]).to_vec();
        let (device, log) = recording();
        let mut data = TimeVaryingDataset::new(desc, vec![raw.clone(), raw]).expect("dataset");
        data.set_time(&device, 0.0).expect("set");
        let slot = data.slot0().map(GpuResource::id).expect("slot0");
        let stored = read_f32s(&log.contents(slot).expect("contents"));
        assert_eq!(stored, vec![1.0, 2.0, 3.0, 0.0]);
    }

    #[test]
    fn wrong_timestep_size_is_rejected() {
        let desc = float_desc(DataFormat::Float, 2);
        let err = TimeVaryingDataset::new(desc, vec![vec![0u8; 3]]).err();
        assert!(matches!(err, Some(DatasetError::TimestepSize { index: 0, .. })));
    }

    #[test]
    fn min_max_folds_row_pairs() {
        assert_eq!(fold_min_max(&[1.0, 2.0, -3.0, 0.5, f32::NAN, 9.0]), Some((-3.0, 2.0)));
        assert_eq!(fold_min_max(&[]), None);
    }

    #[test]
    fn min_max_reads_back_the_row_grid() {
        let backend = RecordingBackend::new().with_hook(KernelId::MinMaxRows, |dispatch, contents| {
            let rows: Vec<f32> = vec![0.5, 1.0, -2.0, 0.25, 0.0, 4.0, 1.0, 1.0];
            if let Some(grid) = contents.get_mut(dispatch.resources[1]) {
                grid.copy_from_slice(bytemuck::cast_slice(&rows));
            }
        });
        let log = backend.handle();
        let device = ComputeDevice::new(backend);
        let mut data = vector_dataset(2);
        assert_eq!(data.min_max(&device).expect("minmax"), None);
        data.set_time(&device, 0.0).expect("set");
        assert_eq!(data.min_max(&device).expect("minmax"), Some((-2.0, 4.0)));
        assert_eq!(log.dispatch_count(KernelId::MinMaxRows), 1);
    }
}
