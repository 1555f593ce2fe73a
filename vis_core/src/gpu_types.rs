//! Parameter blobs and element layouts shared with the compute kernels.
//! All structs are 16-byte multiples so they can back a uniform buffer.

use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct InterpolateUniform {
    pub resolution: [u32; 3],
    pub components: u32,
    pub timestep_t: f32,
    pub _pad: [f32; 3],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct MinMaxUniform {
    pub resolution: [u32; 3],
    pub components: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct MetricUniform {
    pub resolution: [u32; 3],
    pub components: u32,
    /// Lower end of the (possibly reversed) normalisation range.
    pub range_lo: f32,
    pub range_hi: f32,
    pub inv_span: f32,
    pub timestep_t: f32,
    pub boundary_fixed: u32,
    /// Already normalised into `[0,1]` of the range.
    pub boundary_value: f32,
    pub _pad: [u32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct GpuParticle {
    pub pos: [f32; 3],
    pub age: f32,
    pub seed_pos: [f32; 3],
    pub age_seed: f32,
    /// Written by advection; follows the metric when colouring by it.
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct GpuLineVertex {
    pub pos: [f32; 3],
    pub age: f32,
    pub tangent: [f32; 3],
    pub size: f32,
    pub color: [f32; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct GpuTriangleProps {
    pub normal: [f32; 3],
    pub alpha: f32,
    pub area: f32,
    pub curvature: f32,
    pub _pad: [f32; 2],
}

pub mod particle_flags {
    pub const ALPHA_DENSITY: u32 = 1 << 0;
    pub const ALPHA_SHAPE: u32 = 1 << 1;
    pub const ALPHA_CURVATURE: u32 = 1 << 2;
    pub const COLOR_BY_METRIC: u32 = 1 << 3;
    pub const RIBBON_NORMAL: u32 = 1 << 4;
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct ParticleUniform {
    pub box_center: [f32; 3],
    pub max_lifetime: f32,
    pub box_size: [f32; 3],
    pub elapsed: f32,
    pub color: [f32; 4],
    pub time_surface_offset: [f32; 3],
    pub stepsize: f32,
    pub num_particles: u32,
    pub line_length: u32,
    pub reseed_interval: f32,
    pub random: f32,
    pub particle_size: f32,
    pub line_width: f32,
    pub flags: u32,
    pub timestep_t: f32,
    pub alpha_density: f32,
    pub alpha_shape: f32,
    pub alpha_curvature: f32,
    pub _pad: f32,
    pub resolution: [u32; 3],
    pub components: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable, Debug, Default, PartialEq)]
pub struct SliceUniform {
    pub slice_resolution: [u32; 2],
    pub direction: u32,
    pub pass: u32,
    pub position: f32,
    pub lic_length: u32,
    pub lic_stepsize: f32,
    pub lic_threshold: f32,
    pub kernel_sigma: f32,
    pub timestep_t: f32,
    pub _pad: [f32; 2],
    pub volume_resolution: [u32; 3],
    pub components: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn uniforms_are_16_byte_multiples() {
        for size in [
            size_of::<InterpolateUniform>(),
            size_of::<MinMaxUniform>(),
            size_of::<MetricUniform>(),
            size_of::<ParticleUniform>(),
            size_of::<SliceUniform>(),
            size_of::<GpuParticle>(),
            size_of::<GpuLineVertex>(),
            size_of::<GpuTriangleProps>(),
        ] {
            assert_eq!(size % 16, 0, "size {size}");
        }
    }
}
