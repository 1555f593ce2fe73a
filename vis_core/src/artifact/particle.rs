//! Particle probe: particles advected through the vector field plus optional
//! characteristic lines (streamlines, streaklines) and time surfaces seeded
//! inside a manipulation box.

use std::{sync::Arc, time::Duration};

use glam::{UVec3, Vec3, Vec4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use vis_api::prelude::*;

use crate::{
    artifact::Subscription,
    config::ViewerConfig,
    dataset::TimeVaryingDataset,
    gpu_types::{particle_flags, GpuLineVertex, GpuParticle, GpuTriangleProps, ParticleUniform},
    manipulation::{BoxId, BoxRegistry, ManipulationBox, SharedBox},
    metric::DerivedMetricDataset,
    setting_enum,
    settings::{key, Persist, SettingsStore},
    staging::{ExternalDirty, RecomputePolicy, ReconcileOutcome, StagedParams, StagingRecord},
};

pub const PARTICLES_PER_GROUP: u32 = 256;
pub const TRIANGLE_TILE: [u32; 3] = [16, 16, 1];

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum LineMode {
        #[default]
        Disabled => "disabled",
        Streamlines => "streamlines",
        Streaklines => "streaklines",
    }
}

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum SeedingMode {
        #[default]
        Random => "random",
        /// Evenly spaced along the box's longest axis.
        Line => "line",
        /// A line on the box's largest face, released as time surfaces.
        Surface => "surface",
    }
}

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum RenderMode {
        #[default]
        Particles => "particles",
        Lines => "lines",
        Surface => "surface",
    }
}

setting_enum! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub enum RibbonOrientation {
        #[default]
        Tangent => "tangent",
        Normal => "normal",
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParticleParams {
    pub enabled: bool,
    pub count: u32,
    pub max_lifetime: f32,
    pub particle_size: f32,
    pub color: Vec4,
    pub color_by_metric: bool,
    pub seeding: SeedingMode,
    pub line_mode: LineMode,
    pub render_mode: RenderMode,
    pub line_length: u32,
    pub line_width: f32,
    pub stepsize: f32,
    pub reseed_interval: f32,
    pub ribbon: RibbonOrientation,
    pub time_surfaces: u32,
    pub alpha_density: bool,
    pub alpha_density_coeff: f32,
    pub alpha_shape: bool,
    pub alpha_shape_coeff: f32,
    pub alpha_curvature: bool,
    pub alpha_curvature_coeff: f32,
}

impl Default for ParticleParams {
    fn default() -> Self {
        Self {
            enabled: true,
            count: 100,
            max_lifetime: 5.0,
            particle_size: 0.005,
            color: Vec4::ONE,
            color_by_metric: false,
            seeding: SeedingMode::Random,
            line_mode: LineMode::Disabled,
            render_mode: RenderMode::Particles,
            line_length: 150,
            line_width: 0.005,
            stepsize: 0.1,
            reseed_interval: 0.05,
            ribbon: RibbonOrientation::Tangent,
            time_surfaces: 3,
            alpha_density: true,
            alpha_density_coeff: 100.0,
            alpha_shape: true,
            alpha_shape_coeff: 0.75,
            alpha_curvature: true,
            alpha_curvature_coeff: 2.0,
        }
    }
}

impl ParticleParams {
    pub fn lines_enabled(&self) -> bool {
        self.line_mode != LineMode::Disabled
    }

    fn needs_triangles(&self) -> bool {
        self.lines_enabled() && self.render_mode == RenderMode::Surface
    }

    /// Resolves mode combinations that cannot be rendered and clamps counts.
    pub fn normalize(&mut self, max_particles: u32) {
        if self.seeding == SeedingMode::Surface {
            self.render_mode = RenderMode::Surface;
            self.line_mode = LineMode::Streaklines;
        }
        if self.render_mode == RenderMode::Surface && self.seeding == SeedingMode::Random {
            self.seeding = SeedingMode::Line;
        }
        self.count = self.count.clamp(2, max_particles.max(2));
        self.line_length = self.line_length.max(2);
        self.time_surfaces = self.time_surfaces.max(1);
    }

    /// Lifetime the kernels age particles against.
    pub fn effective_lifetime(&self) -> f32 {
        let segments = self.line_length.saturating_sub(1) as f32;
        match self.line_mode {
            LineMode::Streamlines => segments * self.stepsize,
            LineMode::Streaklines if self.seeding != SeedingMode::Surface => {
                segments * self.reseed_interval
            }
            _ => self.max_lifetime,
        }
    }

    /// Density coefficient scaled by particle count and integration step.
    pub fn effective_alpha_density(&self) -> f32 {
        let base = self.alpha_density_coeff / (self.count as f32 * 10_000.0);
        match self.line_mode {
            LineMode::Streamlines => base * self.stepsize,
            LineMode::Streaklines => base * self.reseed_interval,
            LineMode::Disabled => base,
        }
    }

    fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.alpha_density {
            flags |= particle_flags::ALPHA_DENSITY;
        }
        if self.alpha_shape {
            flags |= particle_flags::ALPHA_SHAPE;
        }
        if self.alpha_curvature {
            flags |= particle_flags::ALPHA_CURVATURE;
        }
        if self.color_by_metric {
            flags |= particle_flags::COLOR_BY_METRIC;
        }
        if self.ribbon == RibbonOrientation::Normal {
            flags |= particle_flags::RIBBON_NORMAL;
        }
        flags
    }

    fn uniform(&self, spawn: &ManipulationBox, step: &StepInputs) -> ParticleUniform {
        ParticleUniform {
            box_center: spawn.center().to_array(),
            max_lifetime: self.effective_lifetime(),
            box_size: spawn.size().to_array(),
            elapsed: step.elapsed,
            color: self.color.to_array(),
            time_surface_offset: time_surface_offset(self, spawn.largest_face_axis()).to_array(),
            stepsize: self.stepsize,
            num_particles: self.count,
            line_length: self.line_length,
            reseed_interval: self.reseed_interval,
            random: step.random,
            particle_size: self.particle_size,
            line_width: self.line_width,
            flags: self.flags(),
            timestep_t: step.timestep_t,
            alpha_density: self.effective_alpha_density(),
            alpha_shape: self.alpha_shape_coeff,
            alpha_curvature: self.alpha_curvature_coeff,
            _pad: 0.0,
            resolution: step.resolution.to_array(),
            components: step.components,
        }
    }
}

impl StagedParams for ParticleParams {
    fn structural_diff(&self, other: &Self) -> bool {
        self.count != other.count
            || self.line_length != other.line_length
            || self.lines_enabled() != other.lines_enabled()
            || self.needs_triangles() != other.needs_triangles()
            || self.seeding != other.seeding
            || (self.seeding == SeedingMode::Surface && self.time_surfaces != other.time_surfaces)
    }

    fn parametric_diff(&self, other: &Self) -> bool {
        self != other
    }

    fn policy(&self) -> RecomputePolicy {
        if self.line_mode == LineMode::Streaklines {
            RecomputePolicy::AlwaysRecompute
        } else if self.render_mode == RenderMode::Surface && self.alpha_density {
            RecomputePolicy::ViewDependent
        } else {
            RecomputePolicy::CacheOnEqual
        }
    }
}

impl Persist for ParticleParams {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        store.write(key(prefix, "enabled"), &self.enabled);
        store.write(key(prefix, "count"), &self.count);
        store.write(key(prefix, "max_lifetime"), &self.max_lifetime);
        store.write(key(prefix, "particle_size"), &self.particle_size);
        store.write(key(prefix, "color"), &self.color);
        store.write(key(prefix, "color_by_metric"), &self.color_by_metric);
        store.write(key(prefix, "seeding"), &self.seeding);
        store.write(key(prefix, "lines.mode"), &self.line_mode);
        store.write(key(prefix, "lines.render_mode"), &self.render_mode);
        store.write(key(prefix, "lines.length"), &self.line_length);
        store.write(key(prefix, "lines.width"), &self.line_width);
        store.write(key(prefix, "lines.stepsize"), &self.stepsize);
        store.write(key(prefix, "lines.reseed_interval"), &self.reseed_interval);
        store.write(key(prefix, "lines.ribbon"), &self.ribbon);
        store.write(key(prefix, "surface.count"), &self.time_surfaces);
        store.write(key(prefix, "surface.alpha_density"), &self.alpha_density);
        store.write(key(prefix, "surface.alpha_density_coeff"), &self.alpha_density_coeff);
        store.write(key(prefix, "surface.alpha_shape"), &self.alpha_shape);
        store.write(key(prefix, "surface.alpha_shape_coeff"), &self.alpha_shape_coeff);
        store.write(key(prefix, "surface.alpha_curvature"), &self.alpha_curvature);
        store.write(key(prefix, "surface.alpha_curvature_coeff"), &self.alpha_curvature_coeff);
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        store.read(&key(prefix, "enabled"), &mut self.enabled);
        store.read(&key(prefix, "count"), &mut self.count);
        store.read(&key(prefix, "max_lifetime"), &mut self.max_lifetime);
        store.read(&key(prefix, "particle_size"), &mut self.particle_size);
        store.read(&key(prefix, "color"), &mut self.color);
        store.read(&key(prefix, "color_by_metric"), &mut self.color_by_metric);
        store.read(&key(prefix, "seeding"), &mut self.seeding);
        store.read(&key(prefix, "lines.mode"), &mut self.line_mode);
        store.read(&key(prefix, "lines.render_mode"), &mut self.render_mode);
        store.read(&key(prefix, "lines.length"), &mut self.line_length);
        store.read(&key(prefix, "lines.width"), &mut self.line_width);
        store.read(&key(prefix, "lines.stepsize"), &mut self.stepsize);
        store.read(&key(prefix, "lines.reseed_interval"), &mut self.reseed_interval);
        store.read(&key(prefix, "lines.ribbon"), &mut self.ribbon);
        store.read(&key(prefix, "surface.count"), &mut self.time_surfaces);
        store.read(&key(prefix, "surface.alpha_density"), &mut self.alpha_density);
        store.read(&key(prefix, "surface.alpha_density_coeff"), &mut self.alpha_density_coeff);
        store.read(&key(prefix, "surface.alpha_shape"), &mut self.alpha_shape);
        store.read(&key(prefix, "surface.alpha_shape_coeff"), &mut self.alpha_shape_coeff);
        store.read(&key(prefix, "surface.alpha_curvature"), &mut self.alpha_curvature);
        store.read(&key(prefix, "surface.alpha_curvature_coeff"), &mut self.alpha_curvature_coeff);
    }
}

/// The two in-plane axes of the face perpendicular to `face_axis`.
fn surface_axes(face_axis: usize) -> (usize, usize) {
    match face_axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    }
}

/// Offset between consecutive time surfaces in line-vertex space.
pub fn time_surface_offset(params: &ParticleParams, face_axis: usize) -> Vec3 {
    if params.seeding != SeedingMode::Surface {
        return Vec3::ZERO;
    }
    let per_surface = (params.line_length / params.time_surfaces.max(1)) as f32 - 1.0;
    if per_surface <= 0.0 {
        return Vec3::ZERO;
    }
    let step = 1.0 / per_surface;
    match face_axis {
        2 => Vec3::new(0.0, step, 0.0),
        _ => Vec3::new(0.0, 0.0, step),
    }
}

/// Initial particle state. Seeds live in the box's `[0,1]^3`, positions in
/// volume space.
pub fn seed_particles(params: &ParticleParams, spawn: &ManipulationBox, rng: &mut impl Rng) -> Vec<GpuParticle> {
    let count = params.count.max(2);
    let last = (count - 1) as f32;
    let longest = spawn.longest_axis();
    let face_axis = spawn.largest_face_axis();
    let (across, along) = surface_axes(face_axis);

    (0..count)
        .map(|i| {
            let age = params.max_lifetime * rng.gen::<f32>();
            let age_seed = 0.5 * rng.gen::<f32>();
            let t = i as f32 / last;
            let mut seed = Vec3::splat(0.5);
            match params.seeding {
                SeedingMode::Line => seed[longest] = t,
                SeedingMode::Random => seed = Vec3::new(rng.gen(), rng.gen(), rng.gen()),
                SeedingMode::Surface => {
                    seed[across] = t;
                    seed[along] = 0.0;
                    seed[face_axis] = 0.5;
                }
            }
            let pos = (seed - 0.5) * spawn.size() + spawn.center();
            GpuParticle {
                pos: pos.to_array(),
                age,
                seed_pos: seed.to_array(),
                age_seed,
                color: params.color.to_array(),
            }
        })
        .collect()
}

/// Key of the last line initialisation; a different key re-seeds the lines.
#[derive(Clone, Copy, Debug, PartialEq)]
struct LineSeed {
    mode: LineMode,
    reseed_interval: f32,
    color: Vec4,
}

impl LineSeed {
    fn of(params: &ParticleParams) -> Self {
        Self {
            mode: params.line_mode,
            reseed_interval: params.reseed_interval,
            color: params.color,
        }
    }
}

pub struct ParticleBuffers {
    pub particles: GpuResource,
    pub lines: Option<GpuResource>,
    pub triangles: Option<GpuResource>,
    line_seed: Option<LineSeed>,
}

struct StepInputs<'a> {
    slot0: &'a GpuResource,
    slot1: &'a GpuResource,
    metric: Option<&'a GpuResource>,
    resolution: UVec3,
    components: u32,
    elapsed: f32,
    timestep_t: f32,
    random: f32,
}

impl StepInputs<'_> {
    fn with_metric<'r>(&'r self, mut resources: Vec<&'r GpuResource>) -> Vec<&'r GpuResource> {
        resources.extend(self.metric);
        resources
    }
}

fn buffer_len(label: &'static str, a: u32, b: u32, element_size: u32) -> Result<u32, BackendError> {
    a.checked_mul(b).ok_or(BackendError::Allocation {
        label,
        size: a as u64 * b as u64 * element_size as u64,
        reason: "element count overflows".into(),
    })
}

fn allocate_buffers(
    device: &ComputeDevice,
    params: &ParticleParams,
    spawn: &ManipulationBox,
    rng: &mut StdRng,
) -> Result<ParticleBuffers, BackendError> {
    let count = params.count;
    let particles = device.allocate(ResourceDesc::buffer(
        "particles::state",
        count,
        std::mem::size_of::<GpuParticle>() as u32,
    ))?;
    let lines = if params.lines_enabled() {
        let len = buffer_len("particles::lines", count, params.line_length, 48)?;
        Some(device.allocate(ResourceDesc::buffer(
            "particles::lines",
            len,
            std::mem::size_of::<GpuLineVertex>() as u32,
        ))?)
    } else {
        None
    };
    let triangles = if params.needs_triangles() {
        let len = buffer_len("particles::triangles", (count - 1) * 2, params.line_length, 32)?;
        Some(device.allocate(ResourceDesc::buffer(
            "particles::triangles",
            len,
            std::mem::size_of::<GpuTriangleProps>() as u32,
        ))?)
    } else {
        None
    };

    let seeds = seed_particles(params, spawn, rng);
    device.upload(&particles, bytemuck::cast_slice(&seeds))?;
    log::info!(
        "particle buffers for {count} particles, lines {:?}, seeding {:?}",
        params.line_mode,
        params.seeding
    );
    Ok(ParticleBuffers {
        particles,
        lines,
        triangles,
        line_seed: None,
    })
}

fn compute_lines(
    device: &ComputeDevice,
    params: &ParticleParams,
    spawn: &ManipulationBox,
    buffers: &mut ParticleBuffers,
    step: &StepInputs<'_>,
) -> Result<(), BackendError> {
    let Some(lines) = buffers.lines.as_ref() else {
        return Ok(());
    };
    let kernel = match params.line_mode {
        LineMode::Streamlines => KernelId::ComputeStreamlines,
        LineMode::Streaklines => KernelId::ComputeStreaklines,
        LineMode::Disabled => return Ok(()),
    };
    let uniform = params.uniform(spawn, step);
    let bytes = bytemuck::bytes_of(&uniform);
    let groups = params.count.div_ceil(PARTICLES_PER_GROUP);

    let seed = LineSeed::of(params);
    if buffers.line_seed != Some(seed) {
        device.dispatch(
            KernelId::InitCharacteristicLines,
            bytes,
            &[&buffers.particles, lines],
            [groups, params.line_length, 1],
        )?;
        buffers.line_seed = Some(seed);
    }

    let rows = match params.line_mode {
        LineMode::Streaklines => params.line_length,
        _ => 1,
    };
    let resources = step.with_metric(vec![step.slot0, step.slot1, &buffers.particles, lines]);
    device.dispatch(kernel, bytes, &resources, [groups, rows, 1])?;

    if let Some(triangles) = buffers.triangles.as_ref() {
        device.dispatch(
            KernelId::ComputeTriangleProperties,
            bytes,
            &[lines, triangles],
            workgroups_for([2 * params.line_length, params.count - 1, 1], TRIANGLE_TILE),
        )?;
    }
    Ok(())
}

pub struct ParticleProbe {
    record: StagingRecord<ParticleParams, ParticleBuffers>,
    spawn: SharedBox,
    box_id: BoxId,
    upstream: Arc<StaleFlag>,
    metric: Subscription,
    rng: StdRng,
    min_spawn_size: Vec3,
    max_particles: u32,
    advected: u64,
    dump: DebugReadback,
}

impl ParticleProbe {
    pub fn new(
        data: &TimeVaryingDataset,
        boxes: &mut BoxRegistry,
        config: &ViewerConfig,
        params: ParticleParams,
        seed: u64,
    ) -> Self {
        let spawn = ManipulationBox::new(Vec3::new(0.35, 0.5, 0.5), Vec3::new(0.2, 0.2, 0.6))
            .with_face_rule(config.face_axis_rule)
            .into_shared();
        let box_id = boxes.register(&spawn);
        let upstream = StaleFlag::new();
        data.register(&upstream);

        Self {
            record: StagingRecord::new("particles", params),
            spawn,
            box_id,
            upstream,
            metric: Subscription::new(),
            rng: StdRng::seed_from_u64(seed),
            min_spawn_size: config.min_box_extent / data.bounding_box(),
            max_particles: config.max_particles,
            advected: 0,
            dump: DebugReadback::new(
                "particles",
                Duration::from_millis(config.debug_dump_interval_ms),
            )
            .with_max_values(64),
        }
    }

    pub fn params(&self) -> &ParticleParams {
        self.record.pending()
    }

    pub fn params_mut(&mut self) -> &mut ParticleParams {
        self.record.pending_mut()
    }

    pub fn committed(&self) -> &ParticleParams {
        self.record.committed()
    }

    pub fn buffers(&self) -> Option<&ParticleBuffers> {
        self.record.buffers()
    }

    pub fn spawn_box(&self) -> &SharedBox {
        &self.spawn
    }

    pub fn box_id(&self) -> BoxId {
        self.box_id
    }

    pub fn recomputes(&self) -> u64 {
        self.record.recomputes()
    }

    /// Frames in which the particles were advected.
    pub fn advected(&self) -> u64 {
        self.advected
    }

    /// Joins or leaves the metric's subscribers to match colour-by-metric.
    /// Call before the metric's own update so it knows it is observed.
    pub fn sync_subscriptions(&mut self, metric: Option<&DerivedMetricDataset>) {
        let wanted = self.record.pending().color_by_metric;
        match metric {
            Some(metric) => {
                if self.metric.follow(metric, wanted) {
                    log::debug!("particle probe colour-by-metric {wanted}");
                }
            }
            None if wanted => log::warn!("colour by metric requested without a metric dataset"),
            None => {}
        }
    }

    /// Call after `data.set_time` and the metric update of the same frame.
    pub fn update(
        &mut self,
        device: &ComputeDevice,
        data: &TimeVaryingDataset,
        metric: Option<&DerivedMetricDataset>,
        elapsed: f32,
    ) -> ReconcileOutcome {
        self.spawn.borrow_mut().constrain(self.min_spawn_size);
        let max_particles = self.max_particles;
        self.record.pending_mut().normalize(max_particles);

        let (Some(slot0), Some(slot1)) = (data.slot0(), data.slot1()) else {
            return ReconcileOutcome::Skipped;
        };
        let spawn = self.spawn.borrow().clone();
        let upstream_stale = self.upstream.take();
        let metric_stale = self.metric.take();
        let external = ExternalDirty {
            structural: spawn.axis_surface_changed()
                && self.record.pending().seeding != SeedingMode::Random,
            parametric: spawn.changed() || upstream_stale || metric_stale,
        };
        let step = StepInputs {
            slot0,
            slot1,
            metric: if self.metric.is_active() {
                metric.and_then(DerivedMetricDataset::output)
            } else {
                None
            },
            resolution: data.resolution(),
            components: data.format().gpu_components(),
            elapsed,
            timestep_t: data.timestep_t(),
            random: self.rng.gen(),
        };

        let rng = &mut self.rng;
        let outcome = self.record.reconcile(
            external,
            |params| allocate_buffers(device, params, &spawn, rng),
            |params, buffers| compute_lines(device, params, &spawn, buffers, &step),
        );
        if outcome == ReconcileOutcome::Aborted {
            if upstream_stale {
                self.upstream.mark();
            }
            if metric_stale {
                self.metric.mark();
            }
        }

        if let Err(err) = self.advect(device, &spawn, &step) {
            log::warn!("particle advection failed: {err}");
        }
        outcome
    }

    fn advect(&mut self, device: &ComputeDevice, spawn: &ManipulationBox, step: &StepInputs<'_>) -> Result<(), BackendError> {
        let params = self.record.committed();
        let Some(buffers) = self.record.buffers() else {
            return Ok(());
        };
        if !params.enabled {
            return Ok(());
        }
        let uniform = params.uniform(spawn, step);
        let resources = step.with_metric(vec![step.slot0, step.slot1, &buffers.particles]);
        device.dispatch(
            KernelId::AdvectParticles,
            bytemuck::bytes_of(&uniform),
            &resources,
            [params.count.div_ceil(PARTICLES_PER_GROUP), 1, 1],
        )?;
        self.advected += 1;
        Ok(())
    }

    /// Throttled blocking readback of the first particles.
    pub fn dump_particles(&mut self, device: &ComputeDevice, max: usize) -> Option<Vec<GpuParticle>> {
        let buffers = self.record.buffers()?;
        let values = self.dump.dump(device, &buffers.particles)?;
        let particles: &[GpuParticle] = match bytemuck::try_cast_slice(&values) {
            Ok(particles) => particles,
            Err(err) => {
                log::warn!("particle readback has an odd size: {err}");
                return None;
            }
        };
        Some(particles.iter().take(max).copied().collect())
    }
}

impl Persist for ParticleProbe {
    fn save_settings(&self, store: &mut SettingsStore, prefix: &str) {
        self.record.pending().save_settings(store, prefix);
        let spawn = self.spawn.borrow();
        store.write(key(prefix, "spawn.center"), &spawn.center());
        store.write(key(prefix, "spawn.size"), &spawn.size());
    }

    fn load_settings(&mut self, store: &SettingsStore, prefix: &str) {
        self.record.pending_mut().load_settings(store, prefix);
        let mut spawn = self.spawn.borrow_mut();
        if let Some(center) = store.get::<Vec3>(&key(prefix, "spawn.center")) {
            spawn.set_center(center);
        }
        if let Some(size) = store.get::<Vec3>(&key(prefix, "spawn.size")) {
            spawn.set_size(size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DataFormat, VolumeDesc};

    fn dataset() -> TimeVaryingDataset {
        let desc = VolumeDesc {
            resolution: UVec3::new(4, 4, 4),
            slice_thickness: Vec3::ONE,
            format: DataFormat::Float4,
            dt: 1.0,
        };
        let bytes = desc.voxel_count() * 16;
        TimeVaryingDataset::new(desc, vec![vec![0; bytes]; 3]).expect("dataset")
    }

    struct Rig {
        device: ComputeDevice,
        log: RecordingHandle,
        data: TimeVaryingDataset,
        boxes: BoxRegistry,
        probe: ParticleProbe,
    }

    impl Rig {
        fn new(params: ParticleParams) -> Self {
            let backend = RecordingBackend::new();
            let log = backend.handle();
            let device = ComputeDevice::new(backend);
            let mut data = dataset();
            let mut boxes = BoxRegistry::new();
            let probe = ParticleProbe::new(&data, &mut boxes, &ViewerConfig::default(), params, 7);
            data.set_time(&device, 0.25).expect("set");
            Self {
                device,
                log,
                data,
                boxes,
                probe,
            }
        }

        fn frame(&mut self) -> ReconcileOutcome {
            let outcome = self.probe.update(&self.device, &self.data, None, 0.016);
            self.boxes.end_frame();
            outcome
        }

        fn particles(&self) -> Option<ResourceId> {
            self.probe.buffers().map(|b| b.particles.id())
        }
    }

    fn lines(mode: LineMode) -> ParticleParams {
        ParticleParams {
            line_mode: mode,
            count: 8,
            line_length: 10,
            ..ParticleParams::default()
        }
    }

    #[test]
    fn line_seeding_spreads_along_the_longest_axis() {
        let spawn = ManipulationBox::new(Vec3::new(0.35, 0.5, 0.5), Vec3::new(0.2, 0.2, 0.6));
        let params = ParticleParams {
            seeding: SeedingMode::Line,
            count: 3,
            ..ParticleParams::default()
        };
        let seeds = seed_particles(&params, &spawn, &mut StdRng::seed_from_u64(1));
        assert_eq!(seeds.len(), 3);
        assert_eq!(seeds[0].seed_pos, [0.5, 0.5, 0.0]);
        assert_eq!(seeds[2].seed_pos, [0.5, 0.5, 1.0]);
        assert!((seeds[1].pos[2] - 0.5).abs() < 1e-6);
        assert!((seeds[2].pos[2] - 0.8).abs() < 1e-6);
        assert!(seeds.iter().all(|p| p.age >= 0.0 && p.age < 5.0 && p.age_seed < 0.5));
    }

    #[test]
    fn surface_seeding_uses_the_largest_face() {
        // largest face is xy, so seeds run along x at y = 0, z = 0.5
        let spawn = ManipulationBox::new(Vec3::splat(0.5), Vec3::new(0.6, 0.4, 0.1));
        let params = ParticleParams {
            seeding: SeedingMode::Surface,
            count: 2,
            line_length: 150,
            time_surfaces: 3,
            ..ParticleParams::default()
        };
        let seeds = seed_particles(&params, &spawn, &mut StdRng::seed_from_u64(1));
        assert_eq!(seeds[1].seed_pos, [1.0, 0.0, 0.5]);
        let offset = time_surface_offset(&params, spawn.largest_face_axis());
        assert!((offset.y - 1.0 / 49.0).abs() < 1e-6);
        assert_eq!(time_surface_offset(&ParticleParams::default(), 2), Vec3::ZERO);
    }

    #[test]
    fn lifetime_of_unnormalized_params() {
        let params = ParticleParams {
            line_mode: LineMode::Streamlines,
            line_length: 0,
            ..ParticleParams::default()
        };
        assert_eq!(params.effective_lifetime(), 0.0);
        let params = ParticleParams {
            line_length: 11,
            stepsize: 0.5,
            ..params
        };
        assert_eq!(params.effective_lifetime(), 5.0);
    }

    #[test]
    fn mode_coupling() {
        let mut params = ParticleParams {
            seeding: SeedingMode::Surface,
            ..ParticleParams::default()
        };
        params.normalize(1 << 20);
        assert_eq!(params.render_mode, RenderMode::Surface);
        assert_eq!(params.line_mode, LineMode::Streaklines);

        let mut params = ParticleParams {
            render_mode: RenderMode::Surface,
            count: 0,
            ..ParticleParams::default()
        };
        params.normalize(1 << 20);
        assert_eq!(params.seeding, SeedingMode::Line);
        assert_eq!(params.count, 2);
    }

    #[test]
    fn policy_follows_line_mode() {
        assert_eq!(lines(LineMode::Streaklines).policy(), RecomputePolicy::AlwaysRecompute);
        assert_eq!(lines(LineMode::Streamlines).policy(), RecomputePolicy::CacheOnEqual);
        let surface = ParticleParams {
            render_mode: RenderMode::Surface,
            ..lines(LineMode::Streamlines)
        };
        assert_eq!(surface.policy(), RecomputePolicy::ViewDependent);
    }

    #[test]
    fn effective_lifetime_per_mode() {
        assert!((lines(LineMode::Streamlines).effective_lifetime() - 0.9).abs() < 1e-6);
        assert!((lines(LineMode::Streaklines).effective_lifetime() - 0.45).abs() < 1e-6);
        assert_eq!(lines(LineMode::Disabled).effective_lifetime(), 5.0);
    }

    #[test]
    fn advection_runs_every_frame() {
        let mut rig = Rig::new(ParticleParams::default());
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_eq!(rig.frame(), ReconcileOutcome::Skipped);
        assert_eq!(rig.frame(), ReconcileOutcome::Skipped);
        assert_eq!(rig.log.dispatch_count(KernelId::AdvectParticles), 3);
        assert_eq!(rig.probe.advected(), 3);

        rig.probe.params_mut().enabled = false;
        rig.frame();
        assert_eq!(rig.log.dispatch_count(KernelId::AdvectParticles), 3);
    }

    #[test]
    fn count_change_reallocates_colour_change_does_not() {
        let mut rig = Rig::new(lines(LineMode::Streamlines));
        rig.frame();
        let before = rig.particles();
        assert_eq!(rig.log.dispatch_count(KernelId::InitCharacteristicLines), 1);
        assert_eq!(rig.log.dispatch_count(KernelId::ComputeStreamlines), 1);

        rig.probe.params_mut().particle_size = 0.01;
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.particles(), before);

        rig.probe.params_mut().count = 16;
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_ne!(rig.particles(), before);
        assert_eq!(rig.log.dispatch_count(KernelId::InitCharacteristicLines), 2);
    }

    #[test]
    fn streaklines_recompute_every_frame() {
        let mut rig = Rig::new(lines(LineMode::Streaklines));
        rig.frame();
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.log.dispatch_count(KernelId::ComputeStreaklines), 3);
        assert_eq!(rig.log.dispatch_count(KernelId::InitCharacteristicLines), 1);
    }

    #[test]
    fn moving_the_spawn_box_recomputes_in_place() {
        let mut rig = Rig::new(lines(LineMode::Streamlines));
        rig.frame();
        let before = rig.particles();
        rig.probe.spawn_box().borrow_mut().set_center(Vec3::new(0.4, 0.5, 0.5));
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.particles(), before);
        assert_eq!(rig.frame(), ReconcileOutcome::Skipped);
    }

    #[test]
    fn axis_change_reseeds_line_seeding_only() {
        let mut rig = Rig::new(ParticleParams {
            seeding: SeedingMode::Line,
            ..lines(LineMode::Streamlines)
        });
        rig.frame();
        let before = rig.particles();
        rig.probe.spawn_box().borrow_mut().set_size(Vec3::new(0.7, 0.2, 0.3));
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
        assert_ne!(rig.particles(), before);
    }

    #[test]
    fn new_upstream_time_recomputes_lines() {
        let mut rig = Rig::new(lines(LineMode::Streamlines));
        rig.frame();
        rig.data.set_time(&rig.device, 1.5).expect("set");
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
    }

    #[test]
    fn surface_rendering_adds_triangle_pass() {
        let mut rig = Rig::new(ParticleParams {
            render_mode: RenderMode::Surface,
            ..lines(LineMode::Streamlines)
        });
        rig.frame();
        assert!(rig.probe.buffers().and_then(|b| b.triangles.as_ref()).is_some());
        assert_eq!(rig.probe.committed().seeding, SeedingMode::Line);
        // alpha density makes it view dependent
        assert_eq!(rig.frame(), ReconcileOutcome::Recomputed);
        assert_eq!(rig.log.dispatch_count(KernelId::ComputeTriangleProperties), 2);
    }

    #[test]
    fn spawn_box_is_kept_inside_the_volume() {
        let mut rig = Rig::new(ParticleParams::default());
        rig.probe.spawn_box().borrow_mut().set_center(Vec3::new(1.5, 0.5, 0.5));
        rig.frame();
        let spawn = rig.probe.spawn_box().borrow();
        assert!((spawn.center().x - 0.9).abs() < 1e-6);
    }

    #[test]
    fn failed_allocation_keeps_old_buffers() {
        let mut rig = Rig::new(ParticleParams::default());
        rig.frame();
        let before = rig.particles();
        rig.probe.params_mut().count = 50;
        rig.log.fail_next_allocations(1);
        assert_eq!(rig.frame(), ReconcileOutcome::Aborted);
        assert_eq!(rig.particles(), before);
        assert_eq!(rig.probe.committed().count, 100);
        assert_eq!(rig.frame(), ReconcileOutcome::Reallocated);
    }

    #[test]
    fn dump_is_throttled() {
        let mut rig = Rig::new(ParticleParams::default());
        rig.frame();
        let dumped = rig.probe.dump_particles(&rig.device, 4).expect("first dump");
        assert_eq!(dumped.len(), 4);
        assert!(rig.probe.dump_particles(&rig.device, 4).is_none());
    }

    #[test]
    fn settings_round_trip_with_spawn_box() {
        let rig = Rig::new(lines(LineMode::Streaklines));
        rig.probe.spawn_box().borrow_mut().set_center(Vec3::new(0.3, 0.4, 0.5));
        let mut store = SettingsStore::new();
        rig.probe.save_settings(&mut store, "particles[0]");
        assert_eq!(store.get_raw("particles[0].lines.mode"), Some("streaklines"));

        let mut other = Rig::new(ParticleParams::default());
        other.probe.load_settings(&store, "particles[0]");
        assert_eq!(other.probe.params(), rig.probe.params());
        assert_eq!(other.probe.spawn_box().borrow().center(), Vec3::new(0.3, 0.4, 0.5));
    }
}
