//! Compute backend contract.
//!
//! The core never talks to a graphics API directly. It hands kernel
//! identifiers, parameter blobs and resource handles to a [`ComputeBackend`]
//! through a [`ComputeDevice`], which owns the backend and turns dropped
//! [`GpuResource`] handles into ordered `release` calls.

use std::{cell::RefCell, fmt, rc::Rc, time::Duration};

use thiserror::Error;

use crate::util::Throttle;

/// Backend-side identity of an allocated resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(pub u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Dense 3D grid, x fastest.
    Volume { dims: [u32; 3] },
    /// Dense 2D grid, x fastest.
    Grid { width: u32, height: u32 },
    /// Structured buffer of `count` elements.
    Buffer { count: u32 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResourceDesc {
    pub label: &'static str,
    pub kind: ResourceKind,
    /// Size in bytes of one element.
    pub element_size: u32,
}

impl ResourceDesc {
    pub fn volume(label: &'static str, dims: [u32; 3], element_size: u32) -> Self {
        Self {
            label,
            kind: ResourceKind::Volume { dims },
            element_size,
        }
    }

    pub fn grid(label: &'static str, width: u32, height: u32, element_size: u32) -> Self {
        Self {
            label,
            kind: ResourceKind::Grid { width, height },
            element_size,
        }
    }

    pub fn buffer(label: &'static str, count: u32, element_size: u32) -> Self {
        Self {
            label,
            kind: ResourceKind::Buffer { count },
            element_size,
        }
    }

    pub fn element_count(&self) -> Option<u64> {
        match self.kind {
            ResourceKind::Volume { dims } => dims
                .iter()
                .try_fold(1u64, |acc, &d| acc.checked_mul(d as u64)),
            ResourceKind::Grid { width, height } => (width as u64).checked_mul(height as u64),
            ResourceKind::Buffer { count } => Some(count as u64),
        }
    }

    /// Sizes that do not fit in 64 bits fail as an allocation error.
    pub fn byte_size(&self) -> Result<u64, BackendError> {
        self.element_count()
            .and_then(|count| count.checked_mul(self.element_size as u64))
            .ok_or_else(|| BackendError::Allocation {
                label: self.label,
                size: u64::MAX,
                reason: "size overflows 64 bits".into(),
            })
    }
}

/// Every compute pass the core knows how to request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KernelId {
    InterpolateTimesteps,
    MinMaxRows,
    MetricVelocityMagnitude,
    MetricDivergence,
    MetricVorticityMagnitude,
    MetricQs,
    MetricQOmega,
    MetricEnstrophyProduction,
    MetricVSquared,
    MetricQParameter,
    MetricLambda2,
    MetricFourthComponent,
    AdvectParticles,
    InitCharacteristicLines,
    ComputeStreamlines,
    ComputeStreaklines,
    ComputeTriangleProperties,
    SliceTransferFunction,
    SliceLic,
    SliceColoredLic,
}

impl KernelId {
    pub const ALL: [KernelId; 20] = [
        KernelId::InterpolateTimesteps,
        KernelId::MinMaxRows,
        KernelId::MetricVelocityMagnitude,
        KernelId::MetricDivergence,
        KernelId::MetricVorticityMagnitude,
        KernelId::MetricQs,
        KernelId::MetricQOmega,
        KernelId::MetricEnstrophyProduction,
        KernelId::MetricVSquared,
        KernelId::MetricQParameter,
        KernelId::MetricLambda2,
        KernelId::MetricFourthComponent,
        KernelId::AdvectParticles,
        KernelId::InitCharacteristicLines,
        KernelId::ComputeStreamlines,
        KernelId::ComputeStreaklines,
        KernelId::ComputeTriangleProperties,
        KernelId::SliceTransferFunction,
        KernelId::SliceLic,
        KernelId::SliceColoredLic,
    ];

    pub const fn label(self) -> &'static str {
        match self {
            KernelId::InterpolateTimesteps => "interpolate_timesteps",
            KernelId::MinMaxRows => "min_max_rows",
            KernelId::MetricVelocityMagnitude => "metric_velocity_magnitude",
            KernelId::MetricDivergence => "metric_divergence",
            KernelId::MetricVorticityMagnitude => "metric_vorticity_magnitude",
            KernelId::MetricQs => "metric_qs",
            KernelId::MetricQOmega => "metric_q_omega",
            KernelId::MetricEnstrophyProduction => "metric_enstrophy_production",
            KernelId::MetricVSquared => "metric_v_squared",
            KernelId::MetricQParameter => "metric_q_parameter",
            KernelId::MetricLambda2 => "metric_lambda2",
            KernelId::MetricFourthComponent => "metric_fourth_component",
            KernelId::AdvectParticles => "advect_particles",
            KernelId::InitCharacteristicLines => "init_characteristic_lines",
            KernelId::ComputeStreamlines => "compute_streamlines",
            KernelId::ComputeStreaklines => "compute_streaklines",
            KernelId::ComputeTriangleProperties => "compute_triangle_properties",
            KernelId::SliceTransferFunction => "slice_transfer_function",
            KernelId::SliceLic => "slice_lic",
            KernelId::SliceColoredLic => "slice_colored_lic",
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("allocation of {size} bytes for `{label}` failed: {reason}")]
    Allocation {
        label: &'static str,
        size: u64,
        reason: String,
    },
    #[error("unknown resource {0}")]
    UnknownResource(ResourceId),
    #[error("upload of {len} bytes into {id} exceeds its {capacity} bytes")]
    UploadOverflow { id: ResourceId, len: usize, capacity: u64 },
    #[error("kernel `{0}` is not available on this backend")]
    MissingKernel(KernelId),
    #[error("kernel `{kernel}` failed: {reason}")]
    Kernel { kernel: KernelId, reason: String },
    #[error("readback of {id} failed: {reason}")]
    Readback { id: ResourceId, reason: String },
}

/// One compute dispatch as seen by the backend.
#[derive(Clone, Copy, Debug)]
pub struct KernelDispatch<'a> {
    pub kernel: KernelId,
    pub params: &'a [u8],
    pub resources: &'a [ResourceId],
    pub workgroups: [u32; 3],
}

pub trait ComputeBackend {
    fn name(&self) -> &str;
    fn allocate(&mut self, desc: &ResourceDesc) -> Result<ResourceId, BackendError>;
    fn release(&mut self, id: ResourceId);
    fn upload(&mut self, target: ResourceId, bytes: &[u8]) -> Result<(), BackendError>;
    /// Upload one timestep of a time-varying dataset into a slot.
    fn upload_slot(
        &mut self,
        target: ResourceId,
        timestep: usize,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        let _ = timestep;
        self.upload(target, bytes)
    }
    /// Queues work; does not wait for completion.
    fn run_kernel(&mut self, dispatch: &KernelDispatch<'_>) -> Result<(), BackendError>;
    /// Blocks until the resource contents are available on the CPU.
    fn read_back(&mut self, resource: ResourceId) -> Result<Vec<u8>, BackendError>;
}

type ReleaseQueue = Rc<RefCell<Vec<ResourceId>>>;

/// Owning handle to a backend resource. Dropping it schedules a release.
pub struct GpuResource {
    id: ResourceId,
    label: &'static str,
    size: u64,
    releases: ReleaseQueue,
}

impl GpuResource {
    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuResource")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("size", &self.size)
            .finish()
    }
}

impl Drop for GpuResource {
    fn drop(&mut self) {
        self.releases.borrow_mut().push(self.id);
    }
}

/// Single-threaded front of a backend.
pub struct ComputeDevice {
    backend: RefCell<Box<dyn ComputeBackend>>,
    releases: ReleaseQueue,
}

impl ComputeDevice {
    pub fn new(backend: impl ComputeBackend + 'static) -> Self {
        Self::from_boxed(Box::new(backend))
    }

    pub fn from_boxed(backend: Box<dyn ComputeBackend>) -> Self {
        Self {
            backend: RefCell::new(backend),
            releases: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn backend_name(&self) -> String {
        self.backend.borrow().name().to_owned()
    }

    /// Hands every dropped handle back to the backend, oldest first.
    pub fn flush_releases(&self) -> usize {
        let pending: Vec<ResourceId> = self.releases.borrow_mut().drain(..).collect();
        if pending.is_empty() {
            return 0;
        }
        let mut backend = self.backend.borrow_mut();
        for id in &pending {
            backend.release(*id);
        }
        pending.len()
    }

    pub fn allocate(&self, desc: ResourceDesc) -> Result<GpuResource, BackendError> {
        self.flush_releases();
        let size = desc.byte_size()?;
        let id = self.backend.borrow_mut().allocate(&desc)?;
        log::trace!("allocated {} `{}` ({} bytes)", id, desc.label, size);
        Ok(GpuResource {
            id,
            label: desc.label,
            size,
            releases: Rc::clone(&self.releases),
        })
    }

    pub fn upload(&self, target: &GpuResource, bytes: &[u8]) -> Result<(), BackendError> {
        self.flush_releases();
        self.backend.borrow_mut().upload(target.id, bytes)
    }

    pub fn upload_slot(
        &self,
        target: &GpuResource,
        timestep: usize,
        bytes: &[u8],
    ) -> Result<(), BackendError> {
        self.flush_releases();
        self.backend
            .borrow_mut()
            .upload_slot(target.id, timestep, bytes)
    }

    pub fn dispatch(
        &self,
        kernel: KernelId,
        params: &[u8],
        resources: &[&GpuResource],
        workgroups: [u32; 3],
    ) -> Result<(), BackendError> {
        self.flush_releases();
        let ids: Vec<ResourceId> = resources.iter().map(|r| r.id).collect();
        self.backend.borrow_mut().run_kernel(&KernelDispatch {
            kernel,
            params,
            resources: &ids,
            workgroups,
        })
    }

    pub fn read_back(&self, resource: &GpuResource) -> Result<Vec<u8>, BackendError> {
        self.flush_releases();
        self.backend.borrow_mut().read_back(resource.id)
    }
}

impl Drop for ComputeDevice {
    fn drop(&mut self) {
        self.flush_releases();
    }
}

/// `ceil(count / group)` per axis.
pub fn workgroups_for(extent: [u32; 3], group: [u32; 3]) -> [u32; 3] {
    [
        extent[0].div_ceil(group[0].max(1)),
        extent[1].div_ceil(group[1].max(1)),
        extent[2].div_ceil(group[2].max(1)),
    ]
}

pub fn read_f32s(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect()
}

/// Throttled blocking readback that logs the non-zero lanes of a buffer.
pub struct DebugReadback {
    name: &'static str,
    throttle: Throttle,
    max_values: usize,
}

impl DebugReadback {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            throttle: Throttle::new(interval),
            max_values: 32,
        }
    }

    pub fn with_max_values(mut self, max_values: usize) -> Self {
        self.max_values = max_values;
        self
    }

    /// Returns the decoded floats when a dump actually happened.
    pub fn dump(&mut self, device: &ComputeDevice, resource: &GpuResource) -> Option<Vec<f32>> {
        if !self.throttle.ready() {
            return None;
        }
        match device.read_back(resource) {
            Ok(bytes) => {
                let values = read_f32s(&bytes);
                let shown: Vec<String> = values
                    .iter()
                    .take(self.max_values)
                    .enumerate()
                    .filter(|(_, v)| **v != 0.0)
                    .map(|(i, v)| format!("{i}: {v:.4}"))
                    .collect();
                if shown.is_empty() {
                    log::debug!("[{}] {}: all zero", self.name, resource.id());
                } else {
                    log::debug!("[{}] {}: [{}]", self.name, resource.id(), shown.join(", "));
                }
                Some(values)
            }
            Err(err) => {
                log::warn!("[{}] debug readback failed: {err}", self.name);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workgroups_round_up() {
        assert_eq!(workgroups_for([65, 3, 1], [32, 2, 2]), [3, 2, 1]);
        assert_eq!(workgroups_for([0, 1, 1], [64, 1, 1]), [0, 1, 1]);
    }

    #[test]
    fn byte_size_follows_kind() {
        assert_eq!(ResourceDesc::volume("v", [4, 4, 2], 16).byte_size().ok(), Some(512));
        assert_eq!(ResourceDesc::grid("g", 3, 5, 8).byte_size().ok(), Some(120));
        assert_eq!(ResourceDesc::buffer("b", 10, 32).byte_size().ok(), Some(320));
    }

    #[test]
    fn oversized_descriptions_fail_instead_of_wrapping() {
        let grid = ResourceDesc::grid("huge", u32::MAX, u32::MAX, 16);
        assert!(matches!(
            grid.byte_size(),
            Err(BackendError::Allocation { label: "huge", .. })
        ));
        let volume = ResourceDesc::volume("huge", [u32::MAX; 3], 4);
        assert_eq!(volume.element_count(), None);
        assert!(volume.byte_size().is_err());
    }

    #[test]
    fn read_f32s_ignores_trailing_bytes() {
        let mut bytes = bytemuck::cast_slice::<f32, u8>(&[1.0, -2.5]).to_vec();
        bytes.push(7);
        assert_eq!(read_f32s(&bytes), vec![1.0, -2.5]);
    }
}
