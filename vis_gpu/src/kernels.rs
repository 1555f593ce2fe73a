//! WGSL sources for every [`KernelId`].
//!
//! Shaders are assembled from snippets: the parameter struct is bound as a
//! uniform at binding 0, resources follow as storage arrays in dispatch
//! order. Volumes are `array<f32>` with `components` lanes per voxel, x
//! fastest. Kernels with an optional metric binding get a different source
//! per binding count.

use vis_api::interface::KernelId;

const VOXEL: &str = r#"
fn voxel(p: vec3<u32>, res: vec3<u32>) -> u32 {
    return p.x + res.x * (p.y + res.y * p.z);
}
"#;

const RAMP: &str = r#"
fn ramp(s: f32) -> vec3<f32> {
    return mix(vec3<f32>(0.23, 0.30, 0.75), vec3<f32>(0.71, 0.02, 0.15), clamp(s, 0.0, 1.0));
}
"#;

/// Vector field blended between `slot0` and `slot1` at `params.timestep_t`.
const FIELD: &str = r#"
fn field_at(p: vec3<u32>, res: vec3<u32>) -> vec4<f32> {
    let c = params.components;
    let i = voxel(min(p, res - vec3<u32>(1u)), res);
    var a = vec4<f32>(0.0);
    var b = vec4<f32>(0.0);
    for (var k = 0u; k < min(c, 4u); k = k + 1u) {
        a[k] = slot0[i * c + k];
        b[k] = slot1[i * c + k];
    }
    return mix(a, b, params.timestep_t);
}
"#;

/// Point lookup in a one-lane volume; `NAME` is the binding.
const SCALAR_AT: &str = r#"
fn NAME_at(p: vec3<u32>, res: vec3<u32>) -> f32 {
    return NAME[voxel(min(p, res - vec3<u32>(1u)), res)];
}
"#;

/// Trilinear `sample_NAME` over `NAME_at`, returning `TYPE`.
const TRILINEAR: &str = r#"
fn sample_NAME(p: vec3<f32>, res: vec3<u32>) -> TYPE {
    let g = clamp(p, vec3<f32>(0.0), vec3<f32>(1.0)) * vec3<f32>(res - vec3<u32>(1u));
    let lo = vec3<u32>(floor(g));
    let f = g - floor(g);
    let x00 = mix(NAME_at(lo, res), NAME_at(lo + vec3<u32>(1u, 0u, 0u), res), f.x);
    let x10 = mix(NAME_at(lo + vec3<u32>(0u, 1u, 0u), res), NAME_at(lo + vec3<u32>(1u, 1u, 0u), res), f.x);
    let x01 = mix(NAME_at(lo + vec3<u32>(0u, 0u, 1u), res), NAME_at(lo + vec3<u32>(1u, 0u, 1u), res), f.x);
    let x11 = mix(NAME_at(lo + vec3<u32>(0u, 1u, 1u), res), NAME_at(lo + vec3<u32>(1u, 1u, 1u), res), f.x);
    return mix(mix(x00, x10, f.y), mix(x01, x11, f.y), f.z);
}
"#;

fn trilinear(name: &str, ty: &str) -> String {
    TRILINEAR.replace("NAME", name).replace("TYPE", ty)
}

const INTERPOLATE_PARAMS: &str = r#"
struct Params {
    resolution: vec3<u32>,
    components: u32,
    timestep_t: f32,
    pad0: f32,
    pad1: f32,
    pad2: f32,
}
"#;

const MIN_MAX_PARAMS: &str = r#"
struct Params {
    resolution: vec3<u32>,
    components: u32,
}
"#;

const METRIC_PARAMS: &str = r#"
struct Params {
    resolution: vec3<u32>,
    components: u32,
    range_lo: f32,
    range_hi: f32,
    inv_span: f32,
    timestep_t: f32,
    boundary_fixed: u32,
    boundary_value: f32,
    pad0: u32,
    pad1: u32,
}
"#;

const PARTICLE_PARAMS: &str = r#"
struct Params {
    box_center: vec3<f32>,
    max_lifetime: f32,
    box_size: vec3<f32>,
    elapsed: f32,
    color: vec4<f32>,
    time_surface_offset: vec3<f32>,
    stepsize: f32,
    num_particles: u32,
    line_length: u32,
    reseed_interval: f32,
    random: f32,
    particle_size: f32,
    line_width: f32,
    flags: u32,
    timestep_t: f32,
    alpha_density: f32,
    alpha_shape: f32,
    alpha_curvature: f32,
    pad0: f32,
    resolution: vec3<u32>,
    components: u32,
}

struct Particle {
    pos: vec3<f32>,
    age: f32,
    seed_pos: vec3<f32>,
    age_seed: f32,
    color: vec4<f32>,
}

struct LineVertex {
    pos: vec3<f32>,
    age: f32,
    tangent: vec3<f32>,
    size: f32,
    color: vec4<f32>,
}

struct Triangle {
    normal: vec3<f32>,
    alpha: f32,
    area: f32,
    curvature: f32,
    pad0: f32,
    pad1: f32,
}

const ALPHA_DENSITY: u32 = 1u;
const ALPHA_SHAPE: u32 = 2u;
const ALPHA_CURVATURE: u32 = 4u;
const COLOR_BY_METRIC: u32 = 8u;
const RIBBON_NORMAL: u32 = 16u;

fn box_point(seed: vec3<f32>) -> vec3<f32> {
    return (seed - vec3<f32>(0.5)) * params.box_size + params.box_center;
}

fn inside(p: vec3<f32>) -> bool {
    return all(p >= vec3<f32>(0.0)) && all(p <= vec3<f32>(1.0));
}
"#;

const PARTICLE_MOTION: &str = r#"
fn velocity(p: vec3<f32>) -> vec3<f32> {
    return sample_field(p, params.resolution).xyz;
}

fn rk2(p: vec3<f32>, h: f32) -> vec3<f32> {
    let mid = p + 0.5 * h * velocity(p);
    return p + h * velocity(mid);
}

fn ribbon_dir(v: vec3<f32>) -> vec3<f32> {
    let len = length(v);
    if (len < 1e-12) {
        return vec3<f32>(0.0);
    }
    let t = v / len;
    if ((params.flags & RIBBON_NORMAL) == 0u) {
        return t;
    }
    var side = cross(t, vec3<f32>(0.0, 0.0, 1.0));
    if (length(side) < 1e-6) {
        side = cross(t, vec3<f32>(0.0, 1.0, 0.0));
    }
    return normalize(side);
}
"#;

const PARTICLE_COLOR_PLAIN: &str = r#"
fn particle_color(p: vec3<f32>) -> vec4<f32> {
    return params.color;
}
"#;

const PARTICLE_COLOR_METRIC: &str = r#"
fn particle_color(p: vec3<f32>) -> vec4<f32> {
    if ((params.flags & COLOR_BY_METRIC) != 0u) {
        return vec4<f32>(ramp(sample_metric(p, params.resolution)), params.color.a);
    }
    return params.color;
}
"#;

/// Surface seeding walks each particle's seed along the time-surface offset;
/// every other mode staggers vertex ages by the reseed interval.
const LINE_SEED: &str = r#"
fn rows_per_surface() -> u32 {
    let spacing = length(params.time_surface_offset);
    if (spacing <= 0.0) {
        return 0u;
    }
    return u32(round(1.0 / spacing)) + 1u;
}

fn line_seed(p: Particle, r: u32) -> vec3<f32> {
    let rows = rows_per_surface();
    if (rows == 0u) {
        return p.seed_pos;
    }
    return p.seed_pos + params.time_surface_offset * f32(r % rows);
}

fn line_age(r: u32) -> f32 {
    let rows = rows_per_surface();
    if (rows == 0u) {
        return f32(r) * params.reseed_interval;
    }
    let surfaces = max(params.line_length / rows, 1u);
    return f32(min(r / rows, surfaces - 1u)) * params.max_lifetime / f32(surfaces);
}
"#;

const SLICE_PARAMS: &str = r#"
struct Params {
    slice_resolution: vec2<u32>,
    direction: u32,
    slice_pass: u32,
    position: f32,
    lic_length: u32,
    lic_stepsize: f32,
    lic_threshold: f32,
    kernel_sigma: f32,
    timestep_t: f32,
    pad0: f32,
    pad1: f32,
    volume_resolution: vec3<u32>,
    components: u32,
}

fn plane_point(uv: vec2<f32>) -> vec3<f32> {
    var p = vec3<f32>(uv.x, uv.y, params.position);
    if (params.direction == 1u) {
        p = vec3<f32>(uv.x, params.position, uv.y);
    } else if (params.direction == 2u) {
        p = vec3<f32>(params.position, uv.x, uv.y);
    }
    return p;
}

fn texel_index(texel: vec2<u32>) -> u32 {
    return texel.x + texel.y * params.slice_resolution.x;
}

fn texel_uv(texel: vec2<u32>) -> vec2<f32> {
    return (vec2<f32>(texel) + vec2<f32>(0.5)) / vec2<f32>(params.slice_resolution);
}
"#;

const LIC: &str = r#"
fn plane_vector(v: vec3<f32>) -> vec2<f32> {
    var w = v.xy;
    if (params.direction == 1u) {
        w = v.xz;
    } else if (params.direction == 2u) {
        w = v.yz;
    }
    return w;
}

fn noise_at(pos: vec2<f32>) -> f32 {
    let size = vec2<i32>(params.slice_resolution);
    let t = clamp(vec2<i32>(floor(pos)), vec2<i32>(0), size - vec2<i32>(1));
    return noise[u32(t.x + t.y * size.x)];
}

fn plane_velocity(pos: vec2<f32>) -> vec2<f32> {
    let uv = pos / vec2<f32>(params.slice_resolution);
    let v = sample_field(plane_point(uv), params.volume_resolution);
    return plane_vector(v.xyz);
}

fn lic(start: vec2<f32>) -> f32 {
    let size = vec2<f32>(params.slice_resolution);
    let sigma = max(params.kernel_sigma * f32(params.lic_length) * 0.5, 1e-3);
    var total = noise_at(start);
    var weight = 1.0;
    for (var dir = 0u; dir < 2u; dir = dir + 1u) {
        let dir_sign = select(1.0, -1.0, dir == 1u);
        var pos = start;
        for (var k = 1u; k <= params.lic_length; k = k + 1u) {
            let v = plane_velocity(pos);
            let speed = length(v);
            if (speed < params.lic_threshold || speed == 0.0) {
                break;
            }
            pos = pos + dir_sign * params.lic_stepsize * v / speed;
            if (any(pos < vec2<f32>(0.0)) || any(pos >= size)) {
                break;
            }
            let x = f32(k) / sigma;
            let w = exp(-0.5 * x * x);
            total = total + w * noise_at(pos);
            weight = weight + w;
        }
    }
    return total / weight;
}
"#;

const METRIC_MATH: &str = r#"
fn partial(p: vec3<u32>, axis: u32) -> vec3<f32> {
    let res = params.resolution;
    var lo = p;
    var hi = p;
    if (lo[axis] > 0u) {
        lo[axis] = lo[axis] - 1u;
    }
    if (hi[axis] + 1u < res[axis]) {
        hi[axis] = hi[axis] + 1u;
    }
    let span = f32(hi[axis] - lo[axis]);
    if (span == 0.0) {
        return vec3<f32>(0.0);
    }
    let a = field_at(lo, res).xyz;
    let b = field_at(hi, res).xyz;
    return (b - a) / span;
}

// Column j holds the derivative along axis j.
fn jacobian(p: vec3<u32>) -> mat3x3<f32> {
    return mat3x3<f32>(partial(p, 0u), partial(p, 1u), partial(p, 2u));
}

fn frobenius2(m: mat3x3<f32>) -> f32 {
    return dot(m[0], m[0]) + dot(m[1], m[1]) + dot(m[2], m[2]);
}

fn strain(j: mat3x3<f32>) -> mat3x3<f32> {
    return 0.5 * (j + transpose(j));
}

fn spin(j: mat3x3<f32>) -> mat3x3<f32> {
    return 0.5 * (j - transpose(j));
}

fn vorticity(j: mat3x3<f32>) -> vec3<f32> {
    return vec3<f32>(j[1].z - j[2].y, j[2].x - j[0].z, j[0].y - j[1].x);
}

// Middle eigenvalue of a symmetric matrix, closed form.
fn middle_eigenvalue(m: mat3x3<f32>) -> f32 {
    let p1 = m[1][0] * m[1][0] + m[2][0] * m[2][0] + m[2][1] * m[2][1];
    let q = (m[0][0] + m[1][1] + m[2][2]) / 3.0;
    let d = vec3<f32>(m[0][0] - q, m[1][1] - q, m[2][2] - q);
    let p2 = dot(d, d) + 2.0 * p1;
    if (p2 < 1e-20) {
        return q;
    }
    let p = sqrt(p2 / 6.0);
    let shifted = m - mat3x3<f32>(vec3<f32>(q, 0.0, 0.0), vec3<f32>(0.0, q, 0.0), vec3<f32>(0.0, 0.0, q));
    let r = clamp(determinant((1.0 / p) * shifted) * 0.5, -1.0, 1.0);
    let phi = acos(r) / 3.0;
    let largest = q + 2.0 * p * cos(phi);
    let smallest = q + 2.0 * p * cos(phi + 2.0943951);
    return 3.0 * q - largest - smallest;
}
"#;

/// Body of `metric_value(v, j)` per metric kernel.
fn metric_body(kernel: KernelId) -> Option<&'static str> {
    let body = match kernel {
        KernelId::MetricVelocityMagnitude => "return length(v.xyz);",
        KernelId::MetricDivergence => "return j[0].x + j[1].y + j[2].z;",
        KernelId::MetricVorticityMagnitude => "return length(vorticity(j));",
        KernelId::MetricQs => "return -0.5 * frobenius2(strain(j));",
        KernelId::MetricQOmega => "return 0.5 * frobenius2(spin(j));",
        KernelId::MetricEnstrophyProduction => "let w = vorticity(j);\n    return dot(w, strain(j) * w);",
        KernelId::MetricVSquared => "return dot(v.xyz, v.xyz);",
        KernelId::MetricQParameter => "return 0.5 * (frobenius2(spin(j)) - frobenius2(strain(j)));",
        KernelId::MetricLambda2 => "let s = strain(j);\n    let o = spin(j);\n    return middle_eigenvalue(s * s + o * o);",
        KernelId::MetricFourthComponent => "return v.w;",
        _ => return None,
    };
    Some(body)
}

struct Shader {
    text: String,
    binding: u32,
}

impl Shader {
    fn new(params: &str) -> Self {
        let mut text = String::from(params);
        text.push_str("\n@group(0) @binding(0) var<uniform> params: Params;\n");
        Self { text, binding: 1 }
    }

    fn storage(mut self, name: &str, element: &str) -> Self {
        self.text.push_str(&format!(
            "@group(0) @binding({}) var<storage, read_write> {name}: array<{element}>;\n",
            self.binding
        ));
        self.binding += 1;
        self
    }

    fn with(mut self, snippet: &str) -> Self {
        self.text.push_str(snippet);
        self
    }

    fn sampler(self, name: &str) -> Self {
        self.with(&SCALAR_AT.replace("NAME", name))
            .with(&trilinear(name, "f32"))
    }

    /// Needs `slot0` and `slot1` bound and `components`/`timestep_t` in the
    /// parameter struct.
    fn field(self) -> Self {
        self.with(FIELD).with(&trilinear("field", "vec4<f32>"))
    }

    fn entry(mut self, body: &str) -> String {
        self.text.push_str(body);
        self.text
    }
}

fn interpolate() -> String {
    Shader::new(INTERPOLATE_PARAMS)
        .storage("slot0", "f32")
        .storage("slot1", "f32")
        .storage("result", "f32")
        .entry(
            r#"
// Large volumes arrive folded into y; see `fold_linear`.
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>, @builtin(num_workgroups) groups: vec3<u32>) {
    let res = params.resolution;
    let i = id.x + id.y * groups.x * 64u;
    if (i >= res.x * res.y * res.z) {
        return;
    }
    let c = max(params.components, 1u);
    result[i] = mix(slot0[i * c], slot1[i * c], params.timestep_t);
}
"#,
        )
}

fn min_max() -> String {
    Shader::new(MIN_MAX_PARAMS)
        .storage("source", "f32")
        .storage("grid", "f32")
        .with(VOXEL)
        .entry(
            r#"
// One (min, max) pair per (y, z) row. Vector data reports magnitudes.
@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let res = params.resolution;
    if (id.y >= res.y || id.z >= res.z) {
        return;
    }
    let c = max(params.components, 1u);
    var lo = 3.0e38;
    var hi = -3.0e38;
    var seen = false;
    for (var x = 0u; x < res.x; x = x + 1u) {
        let base = voxel(vec3<u32>(x, id.y, id.z), res) * c;
        var value = source[base];
        if (c > 1u) {
            var sum = 0.0;
            for (var k = 0u; k < min(c, 3u); k = k + 1u) {
                sum = sum + source[base + k] * source[base + k];
            }
            value = sqrt(sum);
        }
        if (value == value && abs(value) <= 3.0e38) {
            lo = min(lo, value);
            hi = max(hi, value);
            seen = true;
        }
    }
    let row = id.y + id.z * res.y;
    if (!seen) {
        let nan = bitcast<f32>(0x7fc00000u | (params.components & 0u));
        lo = nan;
        hi = nan;
    }
    grid[2u * row] = lo;
    grid[2u * row + 1u] = hi;
}
"#,
        )
}

fn metric(body: &str) -> String {
    Shader::new(METRIC_PARAMS)
        .storage("slot0", "f32")
        .storage("slot1", "f32")
        .storage("result", "f32")
        .with(VOXEL)
        .field()
        .with(METRIC_MATH)
        .with(&format!(
            "\nfn metric_value(v: vec4<f32>, j: mat3x3<f32>) -> f32 {{\n    {body}\n}}\n"
        ))
        .entry(
            r#"
@compute @workgroup_size(32, 2, 2)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let res = params.resolution;
    if (any(id >= res)) {
        return;
    }
    let index = voxel(id, res);
    let edge = any(id == vec3<u32>(0u)) || any(id + vec3<u32>(1u) == res);
    if (params.boundary_fixed != 0u && edge) {
        result[index] = params.boundary_value;
        return;
    }
    let v = field_at(id, res);
    let raw = metric_value(v, jacobian(id));
    result[index] = (raw - params.range_lo) * params.inv_span;
}
"#,
        )
}

/// Particle kernels over the two slots, with the metric bound last when
/// colouring by it.
fn particle_shader(with_metric: bool, tail: &[(&str, &str)]) -> Shader {
    let mut shader = Shader::new(PARTICLE_PARAMS)
        .storage("slot0", "f32")
        .storage("slot1", "f32");
    for (name, element) in tail {
        shader = shader.storage(name, element);
    }
    if with_metric {
        shader = shader.storage("metric", "f32");
    }
    shader = shader.with(VOXEL).with(RAMP).field().with(PARTICLE_MOTION);
    if with_metric {
        shader.sampler("metric").with(PARTICLE_COLOR_METRIC)
    } else {
        shader.with(PARTICLE_COLOR_PLAIN)
    }
}

fn advect(with_metric: bool) -> String {
    particle_shader(with_metric, &[("particles", "Particle")]).entry(
        r#"
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.num_particles) {
        return;
    }
    var p = particles[i];
    p.age = p.age + params.elapsed;
    var pos = rk2(p.pos, params.elapsed);
    if (p.age > params.max_lifetime || !inside(pos)) {
        pos = box_point(p.seed_pos);
        p.age = p.age_seed * params.max_lifetime;
    }
    p.pos = pos;
    p.color = particle_color(pos);
    particles[i] = p;
}
"#,
    )
}

fn init_lines() -> String {
    Shader::new(PARTICLE_PARAMS)
        .storage("particles", "Particle")
        .storage("lines", "LineVertex")
        .with(LINE_SEED)
        .entry(
            r#"
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    let r = id.y;
    if (i >= params.num_particles || r >= params.line_length) {
        return;
    }
    let p = particles[i];
    lines[i * params.line_length + r] = LineVertex(
        box_point(line_seed(p, r)),
        line_age(r),
        vec3<f32>(0.0),
        params.line_width,
        params.color,
    );
}
"#,
        )
}

fn streamlines(with_metric: bool) -> String {
    particle_shader(with_metric, &[("particles", "Particle"), ("lines", "LineVertex")]).entry(
        r#"
// One thread integrates a whole line from its seed.
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    if (i >= params.num_particles) {
        return;
    }
    let base = i * params.line_length;
    var pos = box_point(particles[i].seed_pos);
    for (var r = 0u; r < params.line_length; r = r + 1u) {
        lines[base + r] = LineVertex(
            pos,
            f32(r) * params.stepsize,
            ribbon_dir(velocity(pos)),
            params.line_width,
            particle_color(pos),
        );
        if (inside(pos)) {
            pos = rk2(pos, params.stepsize);
        }
    }
}
"#,
    )
}

fn streaklines(with_metric: bool) -> String {
    particle_shader(with_metric, &[("particles", "Particle"), ("lines", "LineVertex")])
        .with(LINE_SEED)
        .entry(
            r#"
// Every vertex is its own particle, re-emitted from the seed when it expires.
@compute @workgroup_size(256)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let i = id.x;
    let r = id.y;
    if (i >= params.num_particles || r >= params.line_length) {
        return;
    }
    let index = i * params.line_length + r;
    var v = lines[index];
    v.age = v.age + params.elapsed;
    if (params.max_lifetime > 0.0 && v.age >= params.max_lifetime) {
        v.age = v.age - params.max_lifetime * floor(v.age / params.max_lifetime);
        v.pos = box_point(line_seed(particles[i], r));
    } else if (inside(v.pos)) {
        v.pos = rk2(v.pos, params.elapsed);
    }
    v.tangent = ribbon_dir(velocity(v.pos));
    v.size = params.line_width;
    v.color = particle_color(v.pos);
    lines[index] = v;
}
"#,
        )
}

fn triangles() -> String {
    Shader::new(PARTICLE_PARAMS)
        .storage("lines", "LineVertex")
        .storage("triangles", "Triangle")
        .entry(
            r#"
// Two triangles per quad between neighbouring lines `strip` and `strip + 1`.
@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let len = params.line_length;
    let x = id.x;
    let strip = id.y;
    if (x >= 2u * len || strip + 1u >= params.num_particles) {
        return;
    }
    let j = x / 2u;
    let second = x % 2u == 1u;
    let index = strip * 2u * len + x;
    var tri = Triangle(vec3<f32>(0.0), 0.0, 0.0, 0.0, 0.0, 0.0);
    if (j + 1u >= len) {
        triangles[index] = tri;
        return;
    }
    let a0 = lines[strip * len + j];
    let a1 = lines[strip * len + j + 1u];
    let b0 = lines[(strip + 1u) * len + j];
    let b1 = lines[(strip + 1u) * len + j + 1u];

    let p0 = select(a0.pos, b0.pos, second);
    let p1 = select(b0.pos, b1.pos, second);
    let p2 = a1.pos;
    let e1 = p1 - p0;
    let e2 = p2 - p0;
    let n = cross(e1, e2);
    tri.area = 0.5 * length(n);
    if (tri.area > 1e-12) {
        tri.normal = normalize(n);
    }
    let ta = select(a0.tangent, b0.tangent, second);
    let tb = select(a1.tangent, b1.tangent, second);
    tri.curvature = 1.0 - clamp(dot(ta, tb), -1.0, 1.0);

    var alpha = params.color.a;
    if ((params.flags & ALPHA_DENSITY) != 0u) {
        alpha = alpha * clamp(params.alpha_density / max(tri.area, 1e-12), 0.0, 1.0);
    }
    if ((params.flags & ALPHA_SHAPE) != 0u) {
        let edges = dot(e1, e1) + dot(e2, e2) + dot(p2 - p1, p2 - p1);
        let shape = select(0.0, 6.9282032 * tri.area / edges, edges > 0.0);
        alpha = alpha * pow(clamp(shape, 0.0, 1.0), params.alpha_shape);
    }
    if ((params.flags & ALPHA_CURVATURE) != 0u) {
        alpha = alpha * (1.0 - clamp(tri.curvature * params.alpha_curvature, 0.0, 1.0));
    }
    // Neighbours that were re-emitted between frames do not share a surface.
    let gap = 0.5 * params.max_lifetime;
    if (abs(a1.age - a0.age) > gap || abs(b1.age - b0.age) > gap) {
        alpha = 0.0;
    }
    tri.alpha = alpha;
    triangles[index] = tri;
}
"#,
        )
}

fn slice_transfer() -> String {
    Shader::new(SLICE_PARAMS)
        .storage("scalar", "f32")
        .storage("result", "vec4<f32>")
        .with(VOXEL)
        .with(RAMP)
        .sampler("scalar")
        .entry(
            r#"
@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    let texel = id.xy;
    if (any(texel >= params.slice_resolution)) {
        return;
    }
    let s = sample_scalar(plane_point(texel_uv(texel)), params.volume_resolution);
    result[texel_index(texel)] = vec4<f32>(ramp(s), 1.0);
}
"#,
        )
}

fn slice_lic(colored: bool) -> String {
    let shader = Shader::new(SLICE_PARAMS)
        .storage("slot0", "f32")
        .storage("slot1", "f32")
        .storage("noise", "f32");
    let shader = if colored {
        shader.storage("scalar", "f32")
    } else {
        shader
    };
    let shader = shader
        .storage("result", "vec4<f32>")
        .with(VOXEL)
        .with(RAMP)
        .field()
        .with(LIC);
    let (shader, shade) = if colored {
        (
            shader.sampler("scalar"),
            "ramp(sample_scalar(plane_point(texel_uv(texel)), params.volume_resolution)) * l",
        )
    } else {
        (shader, "vec3<f32>(l)")
    };
    shader.entry(&format!(
        r#"
@compute @workgroup_size(16, 16)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {{
    let texel = id.xy;
    if (any(texel >= params.slice_resolution)) {{
        return;
    }}
    let l = lic(vec2<f32>(texel) + vec2<f32>(0.5));
    result[texel_index(texel)] = vec4<f32>({shade}, 1.0);
}}
"#
    ))
}

/// Source for `kernel` with `storage` resources bound, or `None` when the
/// kernel does not take that many.
pub fn source(kernel: KernelId, storage: usize) -> Option<String> {
    use KernelId::*;
    let shader = match (kernel, storage) {
        (InterpolateTimesteps, 3) => interpolate(),
        (MinMaxRows, 2) => min_max(),
        (AdvectParticles, 3 | 4) => advect(storage == 4),
        (InitCharacteristicLines, 2) => init_lines(),
        (ComputeStreamlines, 4 | 5) => streamlines(storage == 5),
        (ComputeStreaklines, 4 | 5) => streaklines(storage == 5),
        (ComputeTriangleProperties, 2) => triangles(),
        (SliceTransferFunction, 2) => slice_transfer(),
        (SliceLic, 4) => slice_lic(false),
        (SliceColoredLic, 5) => slice_lic(true),
        (kernel, 3) => metric(metric_body(kernel)?),
        _ => return None,
    };
    Some(shader)
}

/// Moves x groups beyond `limit` into y. Only kernels that rebuild a linear
/// index from `num_workgroups` accept folded dispatches.
pub fn fold_linear(kernel: KernelId, workgroups: [u32; 3], limit: u32) -> [u32; 3] {
    match (kernel, workgroups) {
        (KernelId::InterpolateTimesteps, [x, 1, 1]) if x > limit && limit > 0 => {
            [limit, x.div_ceil(limit), 1]
        }
        _ => workgroups,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kernel_has_a_source() {
        let storage = |kernel: KernelId| match kernel {
            KernelId::MinMaxRows
            | KernelId::InitCharacteristicLines
            | KernelId::ComputeTriangleProperties
            | KernelId::SliceTransferFunction => 2,
            KernelId::ComputeStreamlines | KernelId::ComputeStreaklines | KernelId::SliceLic => 4,
            KernelId::SliceColoredLic => 5,
            _ => 3,
        };
        for kernel in KernelId::ALL {
            let text = source(kernel, storage(kernel)).unwrap_or_default();
            assert!(text.contains("fn main"), "{kernel}");
        }
    }

    #[test]
    fn binding_count_selects_the_metric_variant() {
        let plain = source(KernelId::AdvectParticles, 3).unwrap_or_default();
        let coloured = source(KernelId::AdvectParticles, 4).unwrap_or_default();
        assert!(!plain.contains("@binding(4)"));
        assert!(coloured.contains("@binding(4) var<storage, read_write> metric"));
        assert!(source(KernelId::AdvectParticles, 5).is_none());
        assert!(source(KernelId::SliceLic, 5).is_none());
    }

    #[test]
    fn samplers_are_renamed() {
        let text = source(KernelId::SliceTransferFunction, 2).unwrap_or_default();
        assert!(text.contains("fn sample_scalar(p: vec3<f32>, res: vec3<u32>) -> f32"));
        assert!(!text.contains("NAME"));
    }

    #[test]
    fn field_and_scalar_share_one_sampler() {
        let text = source(KernelId::SliceColoredLic, 5).unwrap_or_default();
        assert!(text.contains("fn sample_field(p: vec3<f32>, res: vec3<u32>) -> vec4<f32>"));
        assert!(text.contains("fn sample_scalar(p: vec3<f32>, res: vec3<u32>) -> f32"));
        assert_eq!(text.matches("fn sample_field(").count(), 1);
        assert!(!text.contains("NAME") && !text.contains("TYPE"));
    }

    #[test]
    fn oversized_linear_dispatches_fold_into_y() {
        assert_eq!(
            fold_linear(KernelId::InterpolateTimesteps, [70_000, 1, 1], 65_535),
            [65_535, 2, 1]
        );
        assert_eq!(
            fold_linear(KernelId::AdvectParticles, [70_000, 1, 1], 65_535),
            [70_000, 1, 1]
        );
    }
}
