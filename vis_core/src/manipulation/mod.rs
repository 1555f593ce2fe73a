//! Draggable, scalable axis-aligned boxes.
//!
//! Boxes live in the normalised `[0,1]^3` frame of the volume. Artifacts own
//! their box through a [`SharedBox`]; the [`BoxRegistry`] only holds weak
//! references, so a dropped artifact stops being pickable at once.
//!
//! `changed` and `axis_surface_changed` are cleared by
//! [`BoxRegistry::end_frame`], which the frame driver calls after every
//! dependent has reconciled.

mod controller;
mod pick;

use std::{
    cell::RefCell,
    rc::{Rc, Weak},
};

use glam::{Mat4, Vec3};

use crate::config::FaceAxisRule;

pub use controller::{drag_box, InteractionPhase, ManipulationController, PointerState};
pub use pick::{intersect_quad, mouse_ray, pick_box, screen_axis, BoxFace, Ray};

/// Smallest edge a box can be scaled down to.
pub const MIN_EXTENT: f32 = 1e-4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Left button.
    Move,
    /// Middle button.
    Scale,
}

pub fn longest_axis(size: Vec3) -> usize {
    let mut axis = 0;
    for i in 1..3 {
        if size[i] > size[axis] {
            axis = i;
        }
    }
    axis
}

/// Axis perpendicular to the largest face.
pub fn largest_face_axis(size: Vec3, rule: FaceAxisRule) -> usize {
    let areas = [size.y * size.z, size.x * size.z, size.x * size.y];
    match rule {
        FaceAxisRule::Corrected => {
            let mut axis = 0;
            for i in 1..3 {
                if areas[i] > areas[axis] {
                    axis = i;
                }
            }
            axis
        }
        FaceAxisRule::Legacy => {
            let mut axis = 0;
            if areas[0] < areas[1] {
                axis = 1;
            }
            if areas[0] < areas[2] {
                axis = 2;
            }
            axis
        }
    }
}

#[derive(Clone, Debug)]
pub struct ManipulationBox {
    center: Vec3,
    size: Vec3,
    longest_axis: usize,
    largest_face_axis: usize,
    face_rule: FaceAxisRule,
    pub visible: bool,
    pub movable: bool,
    pub scalable: bool,
    changed: bool,
    axis_surface_changed: bool,
    local_to_screen: Mat4,
}

impl ManipulationBox {
    pub fn new(center: Vec3, size: Vec3) -> Self {
        let size = size.max(Vec3::splat(MIN_EXTENT));
        let face_rule = FaceAxisRule::default();
        Self {
            center,
            size,
            longest_axis: longest_axis(size),
            largest_face_axis: largest_face_axis(size, face_rule),
            face_rule,
            visible: true,
            movable: true,
            scalable: true,
            changed: false,
            axis_surface_changed: false,
            local_to_screen: Mat4::IDENTITY,
        }
    }

    pub fn with_capabilities(mut self, movable: bool, scalable: bool) -> Self {
        self.movable = movable;
        self.scalable = scalable;
        self
    }

    pub fn with_face_rule(mut self, rule: FaceAxisRule) -> Self {
        self.face_rule = rule;
        self.largest_face_axis = largest_face_axis(self.size, rule);
        self
    }

    pub fn into_shared(self) -> SharedBox {
        Rc::new(RefCell::new(self))
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn size(&self) -> Vec3 {
        self.size
    }

    pub fn min_corner(&self) -> Vec3 {
        self.center - 0.5 * self.size
    }

    pub fn longest_axis(&self) -> usize {
        self.longest_axis
    }

    pub fn largest_face_axis(&self) -> usize {
        self.largest_face_axis
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn axis_surface_changed(&self) -> bool {
        self.axis_surface_changed
    }

    pub fn local_to_screen(&self) -> Mat4 {
        self.local_to_screen
    }

    pub fn set_local_to_screen(&mut self, transform: Mat4) {
        self.local_to_screen = transform;
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.visible
            && match capability {
                Capability::Move => self.movable,
                Capability::Scale => self.scalable,
            }
    }

    pub fn set_center(&mut self, center: Vec3) {
        self.center = center;
        self.changed = true;
    }

    /// Components are clamped to [`MIN_EXTENT`].
    pub fn set_size(&mut self, size: Vec3) {
        self.size = size.max(Vec3::splat(MIN_EXTENT));
        self.changed = true;
        self.refresh_axes();
    }

    fn refresh_axes(&mut self) {
        let la = longest_axis(self.size);
        let lfa = largest_face_axis(self.size, self.face_rule);
        if la != self.longest_axis || lfa != self.largest_face_axis {
            self.axis_surface_changed = true;
        }
        self.longest_axis = la;
        self.largest_face_axis = lfa;
    }

    /// Keeps the box inside the unit cube with every edge in `[min_size, 1]`.
    /// Only writes, and so only flags a change, when something moved.
    pub fn constrain(&mut self, min_size: Vec3) {
        let size = self.size.clamp(min_size.min(Vec3::ONE), Vec3::ONE);
        if size != self.size {
            self.set_size(size);
        }
        let half = 0.5 * self.size;
        let center = self.center.clamp(half, Vec3::ONE - half);
        if center != self.center {
            self.set_center(center);
        }
    }

    pub fn clear_flags(&mut self) {
        self.changed = false;
        self.axis_surface_changed = false;
    }
}

pub type SharedBox = Rc<RefCell<ManipulationBox>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BoxId(u64);

/// Boxes consulted by picking.
#[derive(Default)]
pub struct BoxRegistry {
    boxes: Vec<(BoxId, Weak<RefCell<ManipulationBox>>)>,
    next_id: u64,
}

impl BoxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, shared: &SharedBox) -> BoxId {
        self.next_id += 1;
        let id = BoxId(self.next_id);
        self.boxes.push((id, Rc::downgrade(shared)));
        id
    }

    pub fn remove(&mut self, id: BoxId) -> bool {
        let before = self.boxes.len();
        self.boxes.retain(|(entry, _)| *entry != id);
        before != self.boxes.len()
    }

    /// Forgets boxes whose owner has been dropped.
    pub fn prune(&mut self) {
        self.boxes.retain(|(_, weak)| weak.strong_count() > 0);
    }

    pub fn len(&self) -> usize {
        self.boxes
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn live(&self) -> impl Iterator<Item = (BoxId, SharedBox)> + '_ {
        self.boxes
            .iter()
            .filter_map(|(id, weak)| weak.upgrade().map(|shared| (*id, shared)))
    }

    pub fn get(&self, id: BoxId) -> Option<SharedBox> {
        self.live().find(|(entry, _)| *entry == id).map(|(_, shared)| shared)
    }

    /// All boxes share the volume's local-to-screen transform.
    pub fn set_local_to_screen(&self, transform: Mat4) {
        for (_, shared) in self.live() {
            shared.borrow_mut().set_local_to_screen(transform);
        }
    }

    /// Clears the per-frame flags of every box. Call once per frame after all
    /// dependents have reconciled.
    pub fn end_frame(&mut self) {
        self.prune();
        for (_, shared) in self.live() {
            shared.borrow_mut().clear_flags();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axes_follow_size() {
        let size = Vec3::new(0.2, 0.5, 0.3);
        // yz = 0.15, xz = 0.06, xy = 0.10
        assert_eq!(longest_axis(size), 1);
        assert_eq!(largest_face_axis(size, FaceAxisRule::Corrected), 0);

        let size = Vec3::new(0.5, 0.2, 0.9);
        // yz = 0.18, xz = 0.45, xy = 0.10
        assert_eq!(longest_axis(size), 2);
        assert_eq!(largest_face_axis(size, FaceAxisRule::Corrected), 1);
    }

    #[test]
    fn legacy_face_rule_compares_against_yz_only() {
        let size = Vec3::new(1.0, 0.5, 0.9);
        // yz = 0.45, xz = 0.9, xy = 0.5
        assert_eq!(largest_face_axis(size, FaceAxisRule::Corrected), 1);
        assert_eq!(largest_face_axis(size, FaceAxisRule::Legacy), 2);
    }

    #[test]
    fn size_writes_set_flags() {
        let mut b = ManipulationBox::new(Vec3::splat(0.5), Vec3::new(0.2, 0.3, 0.4));
        assert!(!b.changed());
        b.set_size(Vec3::new(0.2, 0.3, 0.35));
        assert!(b.changed());
        assert!(!b.axis_surface_changed());
        b.set_size(Vec3::new(0.9, 0.3, 0.35));
        assert!(b.axis_surface_changed());
        assert_eq!(b.longest_axis(), 0);
        b.clear_flags();
        assert!(!b.changed() && !b.axis_surface_changed());
    }

    #[test]
    fn size_is_kept_positive() {
        let mut b = ManipulationBox::new(Vec3::splat(0.5), Vec3::splat(0.2));
        b.set_size(Vec3::new(-1.0, 0.0, 0.3));
        assert!(b.size().min_element() > 0.0);
    }

    #[test]
    fn constrain_only_flags_real_changes() {
        let mut b = ManipulationBox::new(Vec3::new(0.35, 0.5, 0.5), Vec3::new(0.2, 0.2, 0.6));
        b.constrain(Vec3::splat(0.02));
        assert!(!b.changed());

        b.set_center(Vec3::new(0.98, 0.5, 0.1));
        b.clear_flags();
        b.constrain(Vec3::splat(0.02));
        assert!(b.changed());
        assert!((b.center() - Vec3::new(0.9, 0.5, 0.3)).length() < 1e-6);

        b.set_size(Vec3::new(0.001, 2.0, 0.5));
        b.constrain(Vec3::splat(0.02));
        assert_eq!(b.size(), Vec3::new(0.02, 1.0, 0.5));
        assert_eq!(b.center().y, 0.5);
    }

    #[test]
    fn registry_forgets_dropped_boxes() {
        let mut registry = BoxRegistry::new();
        let a = ManipulationBox::new(Vec3::splat(0.5), Vec3::splat(0.2)).into_shared();
        let b = ManipulationBox::new(Vec3::splat(0.5), Vec3::splat(0.2)).into_shared();
        let a_id = registry.register(&a);
        registry.register(&b);
        assert_eq!(registry.len(), 2);
        drop(b);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(a_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn end_frame_clears_every_box() {
        let mut registry = BoxRegistry::new();
        let a = ManipulationBox::new(Vec3::splat(0.5), Vec3::splat(0.2)).into_shared();
        registry.register(&a);
        a.borrow_mut().set_center(Vec3::splat(0.4));
        assert!(a.borrow().changed());
        registry.end_frame();
        assert!(!a.borrow().changed());
    }
}
