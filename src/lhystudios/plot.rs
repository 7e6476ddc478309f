// Pixel-step plotting for the interpreter
//
// Every cut is reduced to unit steps (|dx| <= 1, |dy| <= 1). Steps pass through
// pulse-density modulation and are then grouped into runs of identical steps,
// which the interpreter turns into opcodes.

use super::ops::PlotPoint;

/// Accumulated power needed for one laser pulse
pub const PULSE_THRESHOLD: f64 = 1000.0;

// Flattening tolerance for curves, in device units per segment
const CURVE_SEGMENT_LENGTH: f64 = 4.0;
const MAX_CURVE_SEGMENTS: usize = 10_000;

/// Error types for motion encoding
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MotionError {
    #[error("Plot step ({dx}, {dy}) is not a unit step")]
    GeometryViolation { dx: i32, dy: i32 },

    #[error("Diagonal move ({dx}, {dy}) must have |dx| == |dy|")]
    DiagonalMismatch { dx: i32, dy: i32 },
}

pub type Result<T> = std::result::Result<T, MotionError>;

/// Pulse-density (PPI) modulation state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PulseModulator {
    pub pulse_total: f64,
    /// Keep firing while the total stays positive once a pulse started
    pub group: bool,
    on: bool,
}

impl PulseModulator {
    pub fn new(group: bool) -> Self {
        Self {
            pulse_total: 0.0,
            group,
            on: false,
        }
    }

    /// Decide whether one step fires, for `power` in 0..=1000 and `intensity` in 0..=1
    pub fn modulate(&mut self, power: f64, intensity: f64) -> bool {
        // NaN or negative intensity is no pixel at all and ends a group.
        // A zero pixel still lets a running group spend its positive total.
        if intensity.is_nan() || intensity < 0.0 {
            self.on = false;
            return false;
        }
        self.pulse_total += power * intensity.min(1.0);
        let fire = if self.group && self.on {
            self.pulse_total > 0.0
        } else {
            self.pulse_total >= PULSE_THRESHOLD
        };
        if fire {
            self.pulse_total -= PULSE_THRESHOLD;
        }
        self.on = fire;
        fire
    }

    pub fn reset(&mut self) {
        self.pulse_total = 0.0;
        self.on = false;
    }
}

/// A run of `count` identical unit steps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlotRun {
    pub step_x: i32,
    pub step_y: i32,
    pub count: i32,
    pub on: bool,
}

impl PlotRun {
    pub fn dx(&self) -> i32 {
        self.step_x * self.count
    }

    pub fn dy(&self) -> i32 {
        self.step_y * self.count
    }
}

/// Modulate unit steps and merge consecutive identical ones.
///
/// Fails on any step longer than one pixel per axis; that is a fault in the
/// code that produced the steps.
pub fn group_plots<I>(
    start_x: i32,
    start_y: i32,
    steps: I,
    power: f64,
    modulator: &mut PulseModulator,
) -> Result<Vec<PlotRun>>
where
    I: IntoIterator<Item = PlotPoint>,
{
    let mut runs: Vec<PlotRun> = Vec::new();
    let (mut last_x, mut last_y) = (start_x, start_y);

    for point in steps {
        let dx = point.x.saturating_sub(last_x);
        let dy = point.y.saturating_sub(last_y);
        if dx.abs() > 1 || dy.abs() > 1 {
            return Err(MotionError::GeometryViolation { dx, dy });
        }
        last_x = point.x;
        last_y = point.y;
        if dx == 0 && dy == 0 {
            continue;
        }

        let on = modulator.modulate(power, point.on);
        match runs.last_mut() {
            Some(run) if run.step_x == dx && run.step_y == dy && run.on == on => run.count += 1,
            _ => runs.push(PlotRun {
                step_x: dx,
                step_y: dy,
                count: 1,
                on,
            }),
        }
    }
    Ok(runs)
}

/// Unit steps from (x0, y0) to (x1, y1), start point excluded
pub fn plot_line(x0: i32, y0: i32, x1: i32, y1: i32) -> Vec<(i32, i32)> {
    let (x0, y0, x1, y1) = (x0 as i64, y0 as i64, x1 as i64, y1 as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };

    let mut points = Vec::with_capacity(dx.max(-dy) as usize);
    let mut err = dx + dy;
    let (mut x, mut y) = (x0, y0);
    while x != x1 || y != y1 {
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x += sx;
        }
        if e2 <= dx {
            err += dx;
            y += sy;
        }
        points.push((x as i32, y as i32));
    }
    points
}

/// Unit steps along a polyline, start point excluded
fn plot_polyline(
    start: (i32, i32),
    vertices: impl IntoIterator<Item = (i32, i32)>,
) -> Vec<(i32, i32)> {
    let mut points = Vec::new();
    let mut last = start;
    for vertex in vertices {
        if vertex != last {
            points.extend(plot_line(last.0, last.1, vertex.0, vertex.1));
            last = vertex;
        }
    }
    points
}

fn curve_segments(control_polygon: &[(i32, i32)]) -> usize {
    let length: f64 = control_polygon
        .windows(2)
        .map(|w| {
            let dx = (w[1].0 - w[0].0) as f64;
            let dy = (w[1].1 - w[0].1) as f64;
            dx.hypot(dy)
        })
        .sum();
    ((length / CURVE_SEGMENT_LENGTH).ceil() as usize).clamp(1, MAX_CURVE_SEGMENTS)
}

/// Quadratic Bezier as unit steps
pub fn plot_quad(start: (i32, i32), control: (i32, i32), end: (i32, i32)) -> Vec<(i32, i32)> {
    let segments = curve_segments(&[start, control, end]);
    let (p0, p1, p2) = (to_f64(start), to_f64(control), to_f64(end));
    let vertices = (1..=segments).map(|i| {
        let t = i as f64 / segments as f64;
        let u = 1.0 - t;
        round_point((
            u * u * p0.0 + 2.0 * u * t * p1.0 + t * t * p2.0,
            u * u * p0.1 + 2.0 * u * t * p1.1 + t * t * p2.1,
        ))
    });
    plot_polyline(start, vertices)
}

/// Cubic Bezier as unit steps
pub fn plot_cubic(
    start: (i32, i32),
    c1: (i32, i32),
    c2: (i32, i32),
    end: (i32, i32),
) -> Vec<(i32, i32)> {
    let segments = curve_segments(&[start, c1, c2, end]);
    let (p0, p1, p2, p3) = (to_f64(start), to_f64(c1), to_f64(c2), to_f64(end));
    let vertices = (1..=segments).map(|i| {
        let t = i as f64 / segments as f64;
        let u = 1.0 - t;
        let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
        round_point((
            a * p0.0 + b * p1.0 + c * p2.0 + d * p3.0,
            a * p0.1 + b * p1.1 + c * p2.1 + d * p3.1,
        ))
    });
    plot_polyline(start, vertices)
}

fn to_f64(p: (i32, i32)) -> (f64, f64) {
    (p.0 as f64, p.1 as f64)
}

fn round_point(p: (f64, f64)) -> (i32, i32) {
    (p.0.round() as i32, p.1.round() as i32)
}
