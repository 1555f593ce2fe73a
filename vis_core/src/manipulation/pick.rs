use glam::{Mat4, Vec2, Vec3};

use super::ManipulationBox;

/// Ray in box-local coordinates; `t = 1` reaches the far clip plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ray {
    pub origin: Vec3,
    pub dir: Vec3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BoxFace {
    Front,
    Back,
    Left,
    Right,
    Down,
    Up,
}

impl BoxFace {
    pub const ALL: [BoxFace; 6] = [
        BoxFace::Front,
        BoxFace::Back,
        BoxFace::Left,
        BoxFace::Right,
        BoxFace::Down,
        BoxFace::Up,
    ];

    pub fn axis(self) -> usize {
        match self {
            BoxFace::Left | BoxFace::Right => 0,
            BoxFace::Down | BoxFace::Up => 1,
            BoxFace::Front | BoxFace::Back => 2,
        }
    }

    pub fn local_axis(self) -> Vec3 {
        Vec3::AXES[self.axis()]
    }

    /// Faces on the low side of their axis.
    pub fn inverts(self) -> bool {
        matches!(self, BoxFace::Front | BoxFace::Left | BoxFace::Down)
    }

    /// `(anchor, u, v)` of the face quad for a box at `min` with `size`.
    pub fn quad(self, min: Vec3, size: Vec3) -> (Vec3, Vec3, Vec3) {
        let ex = Vec3::X * size.x;
        let ey = Vec3::Y * size.y;
        let ez = Vec3::Z * size.z;
        match self {
            BoxFace::Front => (min, ex, ey),
            BoxFace::Back => (min + ez, ex, ey),
            BoxFace::Left => (min, ey, ez),
            BoxFace::Right => (min + ex, ey, ez),
            BoxFace::Down => (min, ez, ex),
            BoxFace::Up => (min + ey, ez, ex),
        }
    }
}

/// Unprojects a mouse position in `[0,1]^2` through the inverse of
/// `local_to_screen`. Singular or non-finite transforms give `None`.
pub fn mouse_ray(local_to_screen: &Mat4, mouse: Vec2) -> Option<Ray> {
    let det = local_to_screen.determinant();
    if !det.is_finite() || det.abs() <= f32::EPSILON * f32::EPSILON {
        return None;
    }
    let to_local = local_to_screen.inverse();
    let ndc = 2.0 * mouse - Vec2::ONE;
    let near = to_local.project_point3(ndc.extend(-1.0));
    let far = to_local.project_point3(ndc.extend(1.0));
    let dir = far - near;
    if !near.is_finite() || !dir.is_finite() || dir.length_squared() == 0.0 {
        return None;
    }
    Some(Ray { origin: near, dir })
}

/// Ray parameter of the hit with the quad `p + a*u + b*v`, `a, b` in
/// `[0,1]`. Parallel rays, misses, hits behind the origin and non-finite
/// results are all `None`.
pub fn intersect_quad(ray: &Ray, p: Vec3, u: Vec3, v: Vec3) -> Option<f32> {
    let normal = v.cross(u);
    let denom = normal.dot(ray.dir);
    if denom.abs() <= f32::EPSILON * normal.length() * ray.dir.length() {
        return None;
    }
    let t = normal.dot(p - ray.origin) / denom;
    if !t.is_finite() || t < 0.0 {
        return None;
    }
    let local = ray.origin + t * ray.dir - p;
    let tu = local.dot(u) / u.length_squared();
    let tv = local.dot(v) / v.length_squared();
    let inside = (0.0..=1.0).contains(&tu) && (0.0..=1.0).contains(&tv);
    inside.then_some(t)
}

/// Nearest face of `target` under the mouse.
pub fn pick_box(target: &ManipulationBox, mouse: Vec2) -> Option<(BoxFace, f32)> {
    let ray = mouse_ray(&target.local_to_screen(), mouse)?;
    let (min, size) = (target.min_corner(), target.size());
    BoxFace::ALL
        .iter()
        .filter_map(|face| {
            let (p, u, v) = face.quad(min, size);
            intersect_quad(&ray, p, u, v).map(|t| (*face, t))
        })
        .min_by(|a, b| a.1.total_cmp(&b.1))
}

/// Screen-space direction of `axis`, normalised with a floor on the length.
pub fn screen_axis(local_to_screen: &Mat4, axis: Vec3, min_denominator: f32) -> Vec2 {
    let origin = local_to_screen.project_point3(Vec3::ZERO);
    let end = local_to_screen.project_point3(axis);
    let delta = (end - origin).truncate();
    let projected = delta / delta.length().max(min_denominator);
    if projected.is_finite() {
        projected
    } else {
        Vec2::ZERO
    }
}
