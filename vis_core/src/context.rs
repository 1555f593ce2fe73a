//! Explicit owner of the per-process state every frame needs.

use glam::Mat4;
use vis_api::prelude::*;

use crate::{
    config::ViewerConfig,
    manipulation::{BoxRegistry, InteractionPhase, ManipulationController, PointerState},
};

/// Fields drop in declaration order: the controller releases its weak drag
/// target, then the registry, then the device flushes and tears down the
/// backend.
pub struct VisContext {
    controller: ManipulationController,
    boxes: BoxRegistry,
    device: ComputeDevice,
    config: ViewerConfig,
}

impl VisContext {
    pub fn new(config: ViewerConfig, backend: impl ComputeBackend + 'static) -> Self {
        Self::with_device(config, ComputeDevice::new(backend))
    }

    pub fn with_device(config: ViewerConfig, device: ComputeDevice) -> Self {
        log::info!("context on `{}` backend", device.backend_name());
        Self {
            controller: ManipulationController::new(config.min_axis_denominator),
            boxes: BoxRegistry::new(),
            device,
            config,
        }
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn device(&self) -> &ComputeDevice {
        &self.device
    }

    pub fn boxes(&self) -> &BoxRegistry {
        &self.boxes
    }

    pub fn boxes_mut(&mut self) -> &mut BoxRegistry {
        &mut self.boxes
    }

    /// Registry, device and config at once, for constructing artifacts.
    pub fn parts_mut(&mut self) -> (&mut BoxRegistry, &ComputeDevice, &ViewerConfig) {
        (&mut self.boxes, &self.device, &self.config)
    }

    pub fn controller(&self) -> &ManipulationController {
        &self.controller
    }

    pub fn handle_pointer(&mut self, pointer: PointerState) -> InteractionPhase {
        self.controller.handle_pointer(pointer, &self.boxes)
    }

    /// Every box shares the volume's local-to-screen transform.
    pub fn set_local_to_screen(&self, transform: Mat4) {
        self.boxes.set_local_to_screen(transform);
    }

    /// Clears the per-frame box flags.
    pub fn end_frame(&mut self) {
        self.boxes.end_frame();
    }
}

impl Drop for VisContext {
    fn drop(&mut self) {
        let released = self.device.flush_releases();
        log::debug!("context dropped, {released} pending releases flushed");
    }
}
