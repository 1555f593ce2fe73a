//! Drives a scene on the GPU without a window and logs what every frame did.
//!
//! Usage: `vis_headless [config.json] [--frames N] [--settings out.txt]`

use std::{error::Error, path::PathBuf};

use glam::{UVec3, Vec3};
use vis_core::prelude::*;
use vis_gpu::prelude::*;

const RESOLUTION: u32 = 32;
const TIMESTEPS: usize = 4;
const FRAME_ELAPSED: f32 = 1.0 / 60.0;

struct Args {
    config: Option<PathBuf>,
    frames: u32,
    settings: Option<PathBuf>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        config: None,
        frames: 120,
        settings: None,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--frames" => {
                let value = iter.next().ok_or("--frames needs a value")?;
                args.frames = value
                    .parse()
                    .map_err(|err| format!("bad frame count `{value}`: {err}"))?;
            }
            "--settings" => {
                args.settings = Some(iter.next().ok_or("--settings needs a path")?.into());
            }
            path => args.config = Some(path.into()),
        }
    }
    Ok(args)
}

/// A vortex around the z axis whose strength pulses over time; the fourth
/// lane carries the pulse.
fn swirl_dataset() -> Result<TimeVaryingDataset, DatasetError> {
    let resolution = UVec3::splat(RESOLUTION);
    let desc = VolumeDesc {
        resolution,
        slice_thickness: Vec3::ONE,
        format: DataFormat::Float4,
        dt: 0.5,
    };
    let top = (RESOLUTION - 1) as f32;
    let timesteps = (0..TIMESTEPS)
        .map(|step| {
            let pulse = 1.0 + 0.5 * (step as f32 * 0.8).sin();
            let mut values = Vec::with_capacity(desc.voxel_count() * 4);
            for z in 0..RESOLUTION {
                for y in 0..RESOLUTION {
                    for x in 0..RESOLUTION {
                        let p = Vec3::new(x as f32, y as f32, z as f32) / top - 0.5;
                        values.extend_from_slice(&[-p.y * pulse, p.x * pulse, 0.1 * p.z, pulse]);
                    }
                }
            }
            bytemuck::cast_slice::<f32, u8>(&values).to_vec()
        })
        .collect();
    TimeVaryingDataset::new(desc, timesteps)
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => ViewerConfig::load(path)?,
        None => ViewerConfig::default(),
    };
    init_logging(&config.log_spec, None)?;

    let gpu = GpuContext::new()?;
    let mut ctx = VisContext::new(config, WgpuBackend::new(&gpu));
    let mut scene = Scene::new(&ctx, swirl_dataset()?);

    scene.set_metric(MetricParams {
        kind: MetricKind::VorticityMagnitude,
        ..MetricParams::default()
    });
    scene.add_probe(&mut ctx, ParticleParams {
        color_by_metric: true,
        ..ParticleParams::default()
    });
    scene.add_probe(&mut ctx, ParticleParams {
        seeding: SeedingMode::Line,
        line_mode: LineMode::Streamlines,
        line_length: 64,
        ..ParticleParams::default()
    });
    scene.add_slice(&mut ctx, SliceParams {
        pass: SlicePass::ColoredLic,
        ..SliceParams::default()
    });

    let mut totals = FrameReport::default();
    for frame in 0..args.frames {
        let report = scene.frame(&mut ctx, FRAME_ELAPSED, PointerState::default());
        log::debug!("frame {frame}: {report:?}");
        totals.uploads_performed += report.uploads_performed;
        totals.uploads_avoided += report.uploads_avoided;
        totals.reallocations += report.reallocations;
        totals.recomputes += report.recomputes;
        totals.cache_hits += report.cache_hits;
        totals.aborted += report.aborted;
    }
    log::info!(
        "{} frames on {}: {} uploads ({} avoided), {} reallocations, {} recomputes, {} cache hits, {} aborted",
        args.frames,
        gpu.adapter_name,
        totals.uploads_performed,
        totals.uploads_avoided,
        totals.reallocations,
        totals.recomputes,
        totals.cache_hits,
        totals.aborted,
    );

    if let Some(metric) = scene.metric_mut() {
        match metric.fit_range(ctx.device()) {
            Ok(range) => log::info!("metric range after playback: {range:?}"),
            Err(err) => log::warn!("metric range readback failed: {err}"),
        }
    }
    if let Some(probe) = scene.probe_mut(0) {
        if let Some(particles) = probe.dump_particles(ctx.device(), 4) {
            for particle in particles {
                log::info!("particle at {:?}, age {:.3}", particle.pos, particle.age);
            }
        }
    }

    if let Some(path) = &args.settings {
        let mut store = SettingsStore::new();
        scene.save_settings(&mut store);
        store.save(path)?;
        log::info!("settings written to {}", path.display());
    }
    Ok(())
}
