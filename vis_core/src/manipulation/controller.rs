use std::{cell::RefCell, rc::Weak};

use glam::{Vec2, Vec3};

use super::{pick_box, screen_axis, BoxFace, BoxId, BoxRegistry, Capability, ManipulationBox};

/// Pointer input for one frame; `x`, `y` in `[0,1]`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PointerState {
    pub left_down: bool,
    pub middle_down: bool,
    pub right_down: bool,
    pub wheel_delta: f32,
    pub x: f32,
    pub y: f32,
}

impl PointerState {
    pub fn at(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            ..Self::default()
        }
    }

    pub fn with_left(mut self, down: bool) -> Self {
        self.left_down = down;
        self
    }

    pub fn with_middle(mut self, down: bool) -> Self {
        self.middle_down = down;
        self
    }

    pub fn position(&self) -> Vec2 {
        Vec2::new(self.x, self.y)
    }

    fn holds(&self, capability: Capability) -> bool {
        match capability {
            Capability::Move => self.left_down,
            Capability::Scale => self.middle_down,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InteractionPhase {
    #[default]
    Idle,
    /// A box was hit on this frame's press edge.
    Selecting,
    Dragging,
}

struct DragSession {
    target: Weak<RefCell<ManipulationBox>>,
    id: BoxId,
    face: BoxFace,
    capability: Capability,
    start: Vec2,
    last: Vec2,
    center0: Vec3,
    size0: Vec3,
    screen_axis: Vec2,
}

impl DragSession {
    fn begin(
        target: &super::SharedBox,
        id: BoxId,
        face: BoxFace,
        capability: Capability,
        start: Vec2,
        min_denominator: f32,
    ) -> Self {
        let shared = target.borrow();
        Self {
            target: std::rc::Rc::downgrade(target),
            id,
            face,
            capability,
            start,
            last: start,
            center0: shared.center(),
            size0: shared.size(),
            screen_axis: screen_axis(&shared.local_to_screen(), face.local_axis(), min_denominator),
        }
    }

    fn displacement(&self, mouse: Vec2) -> f32 {
        self.screen_axis.dot(mouse - self.start)
    }

    fn apply(&self, target: &mut ManipulationBox, mouse: Vec2) {
        let d = self.displacement(mouse);
        let axis = self.face.local_axis();
        match self.capability {
            Capability::Move => target.set_center(self.center0 + d * axis),
            Capability::Scale => {
                let sign = if self.face.inverts() { -1.0 } else { 1.0 };
                target.set_size(self.size0 + sign * 2.0 * d * axis);
            }
        }
    }
}

/// Idle -> Selecting (press edge on a box) -> Dragging (held) -> Idle.
pub struct ManipulationController {
    phase: InteractionPhase,
    session: Option<DragSession>,
    previous: PointerState,
    min_axis_denominator: f32,
}

impl ManipulationController {
    pub fn new(min_axis_denominator: f32) -> Self {
        Self {
            phase: InteractionPhase::Idle,
            session: None,
            previous: PointerState::default(),
            min_axis_denominator,
        }
    }

    pub fn phase(&self) -> InteractionPhase {
        self.phase
    }

    pub fn selection(&self) -> Option<(BoxId, BoxFace)> {
        self.session.as_ref().map(|s| (s.id, s.face))
    }

    pub fn handle_pointer(&mut self, pointer: PointerState, registry: &BoxRegistry) -> InteractionPhase {
        let mouse = pointer.position();
        self.phase = match self.session.take() {
            Some(mut session) if pointer.holds(session.capability) => match session.target.upgrade() {
                Some(target) => {
                    if mouse != session.last {
                        session.apply(&mut target.borrow_mut(), mouse);
                        session.last = mouse;
                    }
                    self.session = Some(session);
                    InteractionPhase::Dragging
                }
                None => InteractionPhase::Idle,
            },
            Some(_) => InteractionPhase::Idle,
            None => match self.press_edge(&pointer) {
                Some(capability) => match self.select(capability, mouse, registry) {
                    Some(session) => {
                        log::debug!("selected {:?} face {:?} for {:?}", session.id, session.face, capability);
                        self.session = Some(session);
                        InteractionPhase::Selecting
                    }
                    None => InteractionPhase::Idle,
                },
                None => InteractionPhase::Idle,
            },
        };
        self.previous = pointer;
        self.phase
    }

    fn press_edge(&self, pointer: &PointerState) -> Option<Capability> {
        if pointer.left_down && !self.previous.left_down {
            Some(Capability::Move)
        } else if pointer.middle_down && !self.previous.middle_down {
            Some(Capability::Scale)
        } else {
            None
        }
    }

    /// Nearest hit over every box that allows `capability`.
    fn select(&self, capability: Capability, mouse: Vec2, registry: &BoxRegistry) -> Option<DragSession> {
        let mut best: Option<(BoxId, super::SharedBox, BoxFace, f32)> = None;
        for (id, shared) in registry.live() {
            let hit = {
                let target = shared.borrow();
                if !target.allows(capability) {
                    continue;
                }
                pick_box(&target, mouse)
            };
            if let Some((face, t)) = hit {
                if best.as_ref().map_or(true, |(_, _, _, best_t)| t < *best_t) {
                    best = Some((id, shared, face, t));
                }
            }
        }
        best.map(|(id, shared, face, _)| {
            DragSession::begin(&shared, id, face, capability, mouse, self.min_axis_denominator)
        })
    }
}

/// Starts a drag without picking; used when the caller already knows the face.
pub fn drag_box(
    target: &super::SharedBox,
    face: BoxFace,
    capability: Capability,
    from: Vec2,
    to: Vec2,
    min_denominator: f32,
) {
    let session = DragSession::begin(target, BoxId(0), face, capability, from, min_denominator);
    session.apply(&mut target.borrow_mut(), to);
}
