//! Axis-aligned slice through the volume, coloured by a transfer function or
//! by line integral convolution of a noise texture.

use std::sync::Arc;

use glam::{UVec2, UVec3, Vec3};
use rand::{rngs::StdRng, Rng, SeedableRng};
use vis_api::prelude::*;

use crate::{
    artifact::Subscription,
    config::ViewerConfig,
    dataset::TimeVaryingDataset,
    gpu_types::SliceUniform,
    manipulation::{BoxId, BoxRegistry, ManipulationBox, SharedBox, MIN_EXTENT},
    metric::DerivedMetricDataset,
    setting_enum,
    settings::{key, Persist, SettingsStore},
    staging::{ExternalDirty, ReconcileOutcome, StagedParams, StagingRecord},
};

pub const SLICE_TILE: [u32; 3] = [16, 16, 1];
/// Extent of the slice box along its normal.
pub const SLICE_THICKNESS: f32 = 0.01;
/// Texels per voxel along each slice axis, at most.
pub const MAX_RESOLUTION_SCALE: f32 = 16.0;

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum SliceDirection {
        #[default]
        XY => "xy",
        XZ => "xz",
        YZ => "yz",
    }
}

impl SliceDirection {
    pub fn normal_axis(self) -> usize {
        match self {
            SliceDirection::XY => 2,
            SliceDirection::XZ => 1,
            SliceDirection::YZ => 0,
        }
    }

    pub fn plane_axes(self) -> (usize, usize) {
        match self {
            SliceDirection::XY => (0, 1),
            SliceDirection::XZ => (0, 2),
            SliceDirection::YZ => (1, 2),
        }
    }

    pub fn box_size(self) -> Vec3 {
        let mut size = Vec3::ONE;
        size[self.normal_axis()] = SLICE_THICKNESS;
        size
    }

    /// Texels of the slice for a volume of `resolution`.
    pub fn slice_resolution(self, resolution: UVec3, scale: f32) -> UVec2 {
        let (u, v) = self.plane_axes();
        let scaled = |n: u32| ((n as f32 * scale).round() as u32).max(1);
        UVec2::new(scaled(resolution[u]), scaled(resolution[v]))
    }

    fn index(self) -> u32 {
        match self {
            SliceDirection::XY => 0,
            SliceDirection::XZ => 1,
            SliceDirection::YZ => 2,
        }
    }
}

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum NoiseType {
        Uniform => "uniform",
        #[default]
        Power => "power",
        Spot => "spot",
        Bell => "bell",
    }
}

impl NoiseType {
    pub fn sample(self, param: f32, rng: &mut impl Rng) -> f32 {
        let r: f32 = rng.gen();
        match self {
            NoiseType::Uniform => r,
            NoiseType::Power => r.powf(param),
            NoiseType::Spot => {
                if r > param {
                    0.0
                } else {
                    1.0
                }
            }
            NoiseType::Bell => {
                let x = 2.0 * r - 1.0;
                let falloff = 1.0 - x * x;
                if falloff <= 0.0 {
                    0.0
                } else {
                    (1.0 - 1.0 / falloff).exp()
                }
            }
        }
    }
}

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum SlicePass {
        #[default]
        TransferFunction => "transfer_function",
        Lic => "lic",
        ColoredLic => "colored_lic",
    }
}

impl SlicePass {
    pub fn kernel(self) -> KernelId {
        match self {
            SlicePass::TransferFunction => KernelId::SliceTransferFunction,
            SlicePass::Lic => KernelId::SliceLic,
            SlicePass::ColoredLic => KernelId::SliceColoredLic,
        }
    }

    pub fn samples_scalar(self) -> bool {
        self != SlicePass::Lic
    }

    pub fn convolves(self) -> bool {
        self != SlicePass::TransferFunction
    }

    fn index(self) -> u32 {
        match self {
            SlicePass::TransferFunction => 0,
            SlicePass::Lic => 1,
            SlicePass::ColoredLic => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceParams {
    pub direction: SliceDirection,
    pub resolution_scale: f32,
    pub kernel_sigma: f32,
    pub noise: NoiseType,
    pub noise_param: f32,
    pub lic_length: u32,
    pub lic_stepsize: f32,
    pub lic_threshold: f32,
    pub pass: SlicePass,
}

impl Default for SliceParams {
    fn default() -> Self {
        Self {
            direction: SliceDirection::XY,
            resolution_scale: 2.0,
            kernel_sigma: 1.0,
            noise: NoiseType::Power,
            noise_param: 2.2,
            lic_length: 20,
            lic_stepsize: 1.0,
            lic_threshold: 1e-10,
            pass: SlicePass::TransferFunction,
        }
    }
}

impl SliceParams {
    fn normalize(&mut self) {
        if !(self.resolution_scale.is_finite() && self.resolution_scale > 0.0) {
            self.resolution_scale = 1.0;
        }
        if self.resolution_scale > MAX_RESOLUTION_SCALE {
            log::warn!(
                "slice resolution scale {} clamped to {MAX_RESOLUTION_SCALE}",
                self.resolution_scale
            );
            self.resolution_scale = MAX_RESOLUTION_SCALE;
        }
        self.lic_length = self.lic_length.max(1);
    }

    fn uniform(&self, texels: UVec2, inputs: &SliceInputs<'_>) -> SliceUniform {
        SliceUniform {
            slice_resolution: texels.to_array(),
            direction: self.direction.index(),
            pass: self.pass.index(),
            position: inputs.position,
            lic_length: self.lic_length,
            lic_stepsize: self.lic_stepsize * self.resolution_scale,
            lic_threshold: self.lic_threshold,
            kernel_sigma: self.kernel_sigma,
            timestep_t: inputs.timestep_t,
            _pad: [0.0; 2],
            volume_resolution: inputs.resolution.to_array(),
            components: inputs.components,
        }
    }
}

impl StagedParams for SliceParams {
    fn structural_diff(&self, other: &Self) -> bool {
        self.direction != other.direction
            || self.resolution_scale != other.resolution_scale
            || self.kernel_sigma != other.kernel_sigma
            || self.noise != other.noise
            || self.noise_param != other.noise_param
    }

    fn parametric_diff(&self, other: &Self) -> bool {
        self != other
    }
}

impl Persist for SliceParams {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        store.write(key(prefix, "direction"), &self.direction);
        store.write(key(prefix, "resolution_scale"), &self.resolution_scale);
        store.write(key(prefix, "kernel_sigma"), &self.kernel_sigma);
        store.write(key(prefix, "noise.type"), &self.noise);
        store.write(key(prefix, "noise.param"), &self.noise_param);
        store.write(key(prefix, "lic.length"), &self.lic_length);
        store.write(key(prefix, "lic.stepsize"), &self.lic_stepsize);
        store.write(key(prefix, "lic.threshold"), &self.lic_threshold);
        store.write(key(prefix, "pass"), &self.pass);
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        store.read(&key(prefix, "direction"), &mut self.direction);
        store.read(&key(prefix, "resolution_scale"), &mut self.resolution_scale);
        store.read(&key(prefix, "kernel_sigma"), &mut self.kernel_sigma);
        store.read(&key(prefix, "noise.type"), &mut self.noise);
        store.read(&key(prefix, "noise.param"), &mut self.noise_param);
        store.read(&key(prefix, "lic.length"), &mut self.lic_length);
        store.read(&key(prefix, "lic.stepsize"), &mut self.lic_stepsize);
        store.read(&key(prefix, "lic.threshold"), &mut self.lic_threshold);
        store.read(&key(prefix, "pass"), &mut self.pass);
    }
}

/// One noise value per slice texel, row-major.
pub fn generate_noise(noise: NoiseType, param: f32, texels: UVec2, rng: &mut impl Rng) -> Vec<f32> {
    (0..texels.x as usize * texels.y as usize)
        .map(|_| noise.sample(param, rng))
        .collect()
}

pub struct SliceBuffers {
    pub texels: UVec2,
    /// RGBA per texel.
    pub output: GpuResource,
    pub noise: GpuResource,
}

fn allocate_buffers(
    device: &ComputeDevice,
    params: &SliceParams,
    resolution: UVec3,
    rng: &mut StdRng,
) -> Result<SliceBuffers, BackendError> {
    let texels = params.direction.slice_resolution(resolution, params.resolution_scale);
    let output = device.allocate(ResourceDesc::grid("slice::output", texels.x, texels.y, 16))?;
    let noise = device.allocate(ResourceDesc::grid("slice::noise", texels.x, texels.y, 4))?;
    let values = generate_noise(params.noise, params.noise_param, texels, rng);
    device.upload(&noise, bytemuck::cast_slice(&values))?;
    log::info!("slice {:?} at {texels}", params.direction);
    Ok(SliceBuffers {
        texels,
        output,
        noise,
    })
}

struct SliceInputs<'a> {
    slot0: &'a GpuResource,
    slot1: &'a GpuResource,
    scalar: Option<&'a GpuResource>,
    position: f32,
    timestep_t: f32,
    resolution: UVec3,
    components: u32,
}

fn render_slice(
    device: &ComputeDevice,
    params: &SliceParams,
    buffers: &SliceBuffers,
    inputs: &SliceInputs<'_>,
) -> Result<(), BackendError> {
    let pass = match (params.pass, inputs.scalar) {
        (SlicePass::ColoredLic, None) => SlicePass::Lic,
        (pass, _) => pass,
    };
    let resources: Vec<&GpuResource> = match (pass, inputs.scalar) {
        (SlicePass::TransferFunction, Some(scalar)) => vec![scalar, &buffers.output],
        (SlicePass::ColoredLic, Some(scalar)) => {
            vec![inputs.slot0, inputs.slot1, &buffers.noise, scalar, &buffers.output]
        }
        _ => vec![inputs.slot0, inputs.slot1, &buffers.noise, &buffers.output],
    };
    let uniform = SliceParams { pass, ..params.clone() }.uniform(buffers.texels, inputs);
    device.dispatch(
        pass.kernel(),
        bytemuck::bytes_of(&uniform),
        &resources,
        workgroups_for([buffers.texels.x, buffers.texels.y, 1], SLICE_TILE),
    )
}

pub struct SlicePlane {
    record: StagingRecord<SliceParams, SliceBuffers>,
    plane: SharedBox,
    box_id: BoxId,
    upstream: Arc<StaleFlag>,
    metric: Subscription,
    rng: StdRng,
}

impl SlicePlane {
    pub fn new(
        data: &TimeVaryingDataset,
        boxes: &mut BoxRegistry,
        config: &ViewerConfig,
        params: SliceParams,
        seed: u64,
    ) -> Self {
        let plane = ManipulationBox::new(Vec3::splat(0.5), params.direction.box_size())
            .with_capabilities(true, false)
            .with_face_rule(config.face_axis_rule)
            .into_shared();
        let box_id = boxes.register(&plane);
        let upstream = StaleFlag::new();
        data.register(&upstream);
        Self {
            record: StagingRecord::new("slice", params),
            plane,
            box_id,
            upstream,
            metric: Subscription::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn params(&self) -> &SliceParams {
        self.record.pending()
    }

    pub fn params_mut(&mut self) -> &mut SliceParams {
        self.record.pending_mut()
    }

    pub fn committed(&self) -> &SliceParams {
        self.record.committed()
    }

    pub fn buffers(&self) -> Option<&SliceBuffers> {
        self.record.buffers()
    }

    pub fn plane_box(&self) -> &SharedBox {
        &self.plane
    }

    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    pub fn recomputes(&self) -> u64 {
        self.record.recomputes()
    }

    /// Position of the slice along its normal, in `[0,1]`.
    pub fn position(&self) -> f32 {
        self.plane.borrow().center()[self.record.pending().direction.normal_axis()]
    }

    /// Passes that colour by a scalar follow the metric, but only over vector
    /// data; scalar datasets are sampled directly.
    pub fn sync_subscriptions(
        &mut self,
        data: &TimeVaryingDataset,
        metric: Option<&DerivedMetricDataset>,
    ) {
        let wanted = self.record.pending().pass.samples_scalar() && data.format().is_vector();
        if let Some(metric) = metric {
            if self.metric.follow(metric, wanted) {
                log::debug!("slice metric subscription {wanted}");
            }
        }
    }

    fn fit_box_to_direction(&mut self) {
        let direction = self.record.pending().direction;
        let mut plane = self.plane.borrow_mut();
        let size = direction.box_size();
        if plane.size() != size {
            let mut center = Vec3::splat(0.5);
            center[direction.normal_axis()] = plane.center()[direction.normal_axis()];
            plane.set_size(size);
            plane.set_center(center);
        }
        plane.constrain(Vec3::splat(MIN_EXTENT));
    }

    /// Call after `data.set_time` and the metric update of the same frame.
    pub fn update(
        &mut self,
        device: &ComputeDevice,
        data: &TimeVaryingDataset,
        metric: Option<&DerivedMetricDataset>,
    ) -> ReconcileOutcome {
        self.record.pending_mut().normalize();
        self.fit_box_to_direction();

        let (Some(slot0), Some(slot1)) = (data.slot0(), data.slot1()) else {
            return ReconcileOutcome::Skipped;
        };
        let scalar = if data.format().is_vector() {
            if self.metric.is_active() {
                metric.and_then(DerivedMetricDataset::output)
            } else {
                None
            }
        } else {
            data.current_volume()
        };
        if self.record.pending().pass == SlicePass::TransferFunction && scalar.is_none() {
            log::debug!("slice transfer function has nothing to sample yet");
            return ReconcileOutcome::Skipped;
        }

        let upstream_stale = self.upstream.take();
        let metric_stale = self.metric.take();
        let external = ExternalDirty::parametric(
            self.plane.borrow().changed() || upstream_stale || metric_stale,
        );
        let inputs = SliceInputs {
            slot0,
            slot1,
            scalar,
            position: self.position(),
            timestep_t: data.timestep_t(),
            resolution: data.resolution(),
            components: data.format().gpu_components(),
        };
        let resolution = data.resolution();
        let rng = &mut self.rng;
        let outcome = self.record.reconcile(
            external,
            |params| allocate_buffers(device, params, resolution, rng),
            |params, buffers| render_slice(device, params, buffers, &inputs),
        );
        if outcome == ReconcileOutcome::Aborted {
            if upstream_stale {
                self.upstream.mark();
            }
            if metric_stale {
                self.metric.mark();
            }
        }
        outcome
    }
}

impl Persist for SlicePlane {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        self.record.pending().save_settings(store, prefix);
        store.write(key(prefix, "box.center"), &self.plane.borrow().center());
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        self.record.pending_mut().load_settings(store, prefix);
        if let Some(center) = store.get::<Vec3>(&key(prefix, "box.center")) {
            self.plane.borrow_mut().set_center(center);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dataset::{DataFormat, VolumeDesc},
        metric::MetricParams,
    };

    fn dataset(format: DataFormat) -> TimeVaryingDataset {
        let desc = VolumeDesc {
            resolution: UVec3::new(8, 4, 2),
            slice_thickness: Vec3::ONE,
            format,
            dt: 1.0,
        };
        let bytes = desc.voxel_count() * format.element_size() as usize;
        TimeVaryingDataset::new(desc, vec![vec![0; bytes]; 3]).expect("dataset")
    }

    struct Rig {
        device: ComputeDevice,
        log: RecordingHandle,
        data: TimeVaryingDataset,
        metric: DerivedMetricDataset,
        boxes: BoxRegistry,
        slice: SlicePlane,
    }

    impl Rig {
        fn new(format: DataFormat, params: SliceParams) -> Self {
            let backend = RecordingBackend::new();
            let log = backend.handle();
            let device = ComputeDevice::new(backend);
            let mut data = dataset(format);
            let metric = DerivedMetricDataset::new(&data, MetricParams::default());
            let mut boxes = BoxRegistry::new();
            let slice = SlicePlane::new(&data, &mut boxes, &ViewerConfig::default(), params, 3);
            data.set_time(&device, 0.5).expect("set");
            Self {
                device,
                log,
                data,
                metric,
                boxes,
                slice,
            }
        }

        fn frame(&mut self) -> ReconcileOutcome {
            self.slice.sync_subscriptions(&self.data, Some(&self.metric));
            self.metric.update(&self.device, &self.data);
            let outcome = self.slice.update(&self.device, &self.data, Some(&self.metric));
            self.boxes.end_frame();
            outcome
        }

        fn output(&self) -> Option<ResourceId> {
            self.slice.buffers().map(|b| b.output.id())
        }
    }

    fn lic() -> SliceParams {
        SliceParams {
            pass: SlicePass::Lic,
            ..SliceParams::default()
        }
    }

    #[test]
    fn slice_resolution_follows_direction_and_scale() {
        let res = UVec3::new(8, 4, 2);
        assert_eq!(SliceDirection::XY.slice_resolution(res, 2.0), UVec2::new(16, 8));
        assert_eq!(SliceDirection::XZ.slice_resolution(res, 1.0), UVec2::new(8, 2));
        assert_eq!(SliceDirection::YZ.slice_resolution(res, 0.1), UVec2::new(1, 1));
    }

    #[test]
    fn noise_shapes() {
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..64 {
            let spot = NoiseType::Spot.sample(0.5, &mut rng);
            assert!(spot == 0.0 || spot == 1.0);
            let bell = NoiseType::Bell.sample(0.0, &mut rng);
            assert!((0.0..=1.0).contains(&bell));
            let power = NoiseType::Power.sample(2.2, &mut rng);
            assert!((0.0..1.0).contains(&power));
        }
        let texels = UVec2::new(3, 5);
        assert_eq!(generate_noise(NoiseType::Uniform, 0.0, texels, &mut rng).len(), 15);
    }

    #[test]
    fn slice_box_is_thin_and_fixed_size() {
        let rig = Rig::new(DataFormat::Float4, lic());
        let plane = rig.slice.plane_box().borrow();
        assert_eq!(plane.size(), Vec3::new(1.0, 1.0, SLICE_THICKNESS));
        assert!(plane.movable && !plane.scalable);
    }

    #[test]
    fn lic_allocates_noise_and_renders() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        let buffers = rig.slice.buffers().expect("buffers");
        assert_eq!(buffers.texels, UVec2::new(16, 8));
        let noise = read_f32s(&rig.log.contents(buffers.noise.id()).expect("noise"));
        assert_eq!(noise.len(), 128);
        assert!(noise.iter().any(|v| *v > 0.0));

        let uniform: SliceUniform =
            bytemuck::pod_read_unaligned(&rig.log.last_params(KernelId::SliceLic).expect("params"));
        assert_eq!(uniform.lic_stepsize, 2.0);
        assert_eq!(uniform.position, 0.5);
        assert!(!rig.metric.has_observers());
        assert_eq!(rig.frame(), ReconcileOutcome::Skipped);
    }

    #[test]
    fn lic_edit_is_parametric_sigma_is_structural() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        rig.frame();
        let before = rig.output();
        rig.slice.params_mut().lic_length = 40;
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.output(), before);

        rig.slice.params_mut().kernel_sigma = 2.0;
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_ne!(rig.output(), before);
    }

    #[test]
    fn moving_the_plane_recomputes() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        rig.frame();
        rig.slice.plane_box().borrow_mut().set_center(Vec3::new(0.5, 0.5, 0.2));
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        let uniform: SliceUniform =
            bytemuck::pod_read_unaligned(&rig.log.last_params(KernelId::SliceLic).expect("params"));
        assert!((uniform.position - 0.2).abs() < 1e-6);
    }

    #[test]
    fn direction_change_reorients_the_box() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        rig.frame();
        rig.slice.params_mut().direction = SliceDirection::YZ;
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_eq!(
            rig.slice.plane_box().borrow().size(),
            Vec3::new(SLICE_THICKNESS, 1.0, 1.0)
        );
        assert_eq!(rig.slice.buffers().map(|b| b.texels), Some(UVec2::new(8, 4)));
    }

    #[test]
    fn transfer_function_on_vector_data_subscribes_to_the_metric() {
        let mut rig = Rig::new(DataFormat::Float4, SliceParams::default());
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert!(rig.metric.has_observers());
        assert_eq!(rig.log.dispatch_count(KernelId::SliceTransferFunction), 1);

        rig.metric.params_mut().range.max = 3.0;
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);

        rig.slice.params_mut().pass = SlicePass::Lic;
        rig.frame();
        assert!(!rig.metric.has_observers());
    }

    #[test]
    fn scalar_data_is_sampled_directly() {
        let mut rig = Rig::new(DataFormat::Float, SliceParams::default());
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        let dispatch = rig
            .log
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                vis_api::recording::BackendCall::Dispatch { kernel, resources, .. }
                    if kernel == KernelId::SliceTransferFunction =>
                {
                    Some(resources)
                }
                _ => None,
            })
            .last()
            .expect("dispatch");
        assert_eq!(Some(dispatch[0]), rig.data.current_volume().map(GpuResource::id));
        assert!(!rig.metric.has_observers());

        rig.metric.params_mut().range.max = 3.0;
        assert_eq!(rig.frame(), ReconcileOutcome::Skipped);
    }

    #[test]
    fn oversized_scale_is_clamped_and_failed_allocation_aborts() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        let before = rig.output();

        rig.log.limit_allocation_size(Some(1 << 10));
        rig.slice.params_mut().resolution_scale = 1e12;
        assert_eq!(rig.frame(), ReconcileOutcome::Aborted);
        assert_eq!(rig.slice.params().resolution_scale, MAX_RESOLUTION_SCALE);
        assert_eq!(rig.slice.committed().resolution_scale, 2.0);
        assert_eq!(rig.output(), before);

        rig.log.limit_allocation_size(None);
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_eq!(rig.slice.buffers().map(|b| b.texels), Some(UVec2::new(128, 64)));
    }

    #[test]
    fn settings_round_trip_with_position() {
        let mut rig = Rig::new(DataFormat::Float4, lic());
        rig.slice.params_mut().noise = NoiseType::Bell;
        rig.slice.plane_box().borrow_mut().set_center(Vec3::new(0.5, 0.5, 0.3));
        let mut store = SettingsStore::new();
        rig.slice.save_settings(&mut store, "slice[0]");
        assert_eq!(store.get_raw("slice[0].noise.type"), Some("bell"));

        let mut other = Rig::new(DataFormat::Float4, SliceParams::default());
        other.slice.load_settings(&store, "slice[0]");
        assert_eq!(other.slice.params(), rig.slice.params());
        assert!((other.slice.position() - 0.3).abs() < 1e-6);
    }
}
