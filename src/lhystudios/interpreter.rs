// Lhymicro-GL interpreter
//
// Turns abstract motion ops into board bytes. The board has three modes:
//   RAPID   - default; each move is a self-contained "I...S1P" command
//   FINISH  - concatenated moves ending in "N"
//   PROGRAM - compact mode opened by a speed code; moves stream as opcodes
// PROGRAM is only entered from FINISH.

use std::time::Duration;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::distance::*;
use super::ops::{ByteSink, DriverEvent, MotionOp, PlotPoint, RasterImage};
use super::plot::{
    MotionError, PulseModulator, Result, group_plots, plot_cubic, plot_line, plot_quad,
};
use super::speed::{Board, SpeedCode};
use crate::config::ControllerConfig;

pub const DEFAULT_SPEED: f64 = 30.0;
pub const MAX_POWER: f64 = 1000.0;

bitflags! {
    /// Head direction and momentum, as last signalled to the board
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirectionFlags: u8 {
        const LEFT = 0b0001;
        const TOP = 0b0010;
        const X_MOMENTUM = 0b0100;
        const Y_MOMENTUM = 0b1000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterpreterMode {
    #[default]
    Rapid,
    Program,
    Finish,
}

/// Snapshot reported by `MotionOp::Status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub x: i32,
    pub y: i32,
    pub mode: InterpreterMode,
    pub laser_on: bool,
    pub speed: f64,
    pub power: f64,
    pub raster_step: u32,
}

/// Interpreter state for one device session
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterContext {
    pub x: i32,
    pub y: i32,
    pub min_x: i32,
    pub min_y: i32,
    pub max_x: i32,
    pub max_y: i32,
    pub flags: DirectionFlags,
    pub laser_on: bool,
    pub speed: f64,
    pub power: f64,
    pub raster_step: u32,
    pub d_ratio: Option<f64>,
    pub pulse: PulseModulator,
    pub mode: InterpreterMode,
    pub incremental: bool,
    pub board: Board,
    pub autolock: bool,
    pub fix_speeds: bool,
}

impl InterpreterContext {
    pub fn new(board: Board) -> Self {
        Self {
            x: 0,
            y: 0,
            min_x: 0,
            min_y: 0,
            max_x: 0,
            max_y: 0,
            flags: DirectionFlags::empty(),
            laser_on: false,
            speed: DEFAULT_SPEED,
            power: MAX_POWER,
            raster_step: 0,
            d_ratio: None,
            pulse: PulseModulator::default(),
            mode: InterpreterMode::Rapid,
            incremental: false,
            board,
            autolock: true,
            fix_speeds: false,
        }
    }

    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            d_ratio: config.d_ratio,
            autolock: config.autolock,
            fix_speeds: config.fix_speeds,
            ..Self::new(config.board)
        }
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            x: self.x,
            y: self.y,
            mode: self.mode,
            laser_on: self.laser_on,
            speed: self.speed,
            power: self.power,
            raster_step: self.raster_step,
        }
    }

    /// Speed code for the current settings
    pub fn speed_code(&self) -> SpeedCode {
        SpeedCode::new(self.board, self.speed)
            .raster_step(self.raster_step)
            .d_ratio(self.d_ratio)
            .fix_speeds(self.fix_speeds)
    }

    fn check_bounds(&mut self) {
        self.min_x = self.min_x.min(self.x);
        self.min_y = self.min_y.min(self.y);
        self.max_x = self.max_x.max(self.x);
        self.max_y = self.max_y.max(self.y);
    }
}

/// Apply one op, writing its bytes to `out`
pub fn apply<S: ByteSink + ?Sized>(
    op: MotionOp,
    ctx: &mut InterpreterContext,
    out: &mut S,
) -> Result<()> {
    MotionEncoder::new(ctx, out).apply(op)
}

/// Encoder bound to a context and a sink
pub struct MotionEncoder<'a, S: ByteSink + ?Sized> {
    ctx: &'a mut InterpreterContext,
    out: &'a mut S,
}

impl<'a, S: ByteSink + ?Sized> MotionEncoder<'a, S> {
    pub fn new(ctx: &'a mut InterpreterContext, out: &'a mut S) -> Self {
        Self { ctx, out }
    }

    pub fn apply(&mut self, op: MotionOp) -> Result<()> {
        trace!("Applying {:?}", op);
        match op {
            MotionOp::LaserOn => {
                self.laser_on();
            }
            MotionOp::LaserOff => {
                self.laser_off();
            }
            MotionOp::RapidMove { x, y } => {
                self.to_default_mode();
                let (tx, ty) = self.target(x, y);
                self.travel(tx - self.ctx.x, ty - self.ctx.y)?;
            }
            MotionOp::Move { x, y } => {
                let (tx, ty) = self.target(x, y);
                self.travel(tx - self.ctx.x, ty - self.ctx.y)?;
            }
            MotionOp::Cut { x, y } => {
                let (tx, ty) = self.target(x, y);
                self.to_compact_mode();
                let steps = plot_line(self.ctx.x, self.ctx.y, tx, ty);
                self.plot_steps(lit(steps), false)?;
            }
            MotionOp::CutQuad { cx, cy, x, y } => {
                let control = self.target(cx, cy);
                let end = self.target(x, y);
                self.to_compact_mode();
                let steps = plot_quad((self.ctx.x, self.ctx.y), control, end);
                self.plot_steps(lit(steps), false)?;
            }
            MotionOp::CutCubic { c1, c2, x, y } => {
                let c1 = self.target(c1.0, c1.1);
                let c2 = self.target(c2.0, c2.1);
                let end = self.target(x, y);
                self.to_compact_mode();
                let steps = plot_cubic((self.ctx.x, self.ctx.y), c1, c2, end);
                self.plot_steps(lit(steps), false)?;
            }
            MotionOp::Plot { points } => {
                self.to_compact_mode();
                self.plot_steps(points, false)?;
            }
            MotionOp::Raster { image } => self.raster(&image)?,
            MotionOp::HStep => self.h_switch(),
            MotionOp::VStep => self.v_switch(),
            MotionOp::Home => self.home(),
            MotionOp::LockRail => {
                self.to_default_mode();
                self.out.write(LOCK_RAIL);
            }
            MotionOp::UnlockRail => {
                self.to_default_mode();
                self.out.write(UNLOCK_RAIL);
            }
            MotionOp::SetSpeed { speed } => self.set_speed(speed),
            MotionOp::SetPower { power } => self.set_power(power),
            MotionOp::SetStep { step } => self.set_step(step),
            MotionOp::SetDRatio { d_ratio } => self.set_d_ratio(d_ratio),
            MotionOp::SetDirection {
                left,
                top,
                x_dir,
                y_dir,
            } => {
                let flags = &mut self.ctx.flags;
                flags.set(DirectionFlags::LEFT, left);
                flags.set(DirectionFlags::TOP, top);
                flags.set(DirectionFlags::X_MOMENTUM, x_dir);
                flags.set(DirectionFlags::Y_MOMENTUM, y_dir);
            }
            MotionOp::SetIncremental => self.ctx.incremental = true,
            MotionOp::SetAbsolute => self.ctx.incremental = false,
            MotionOp::SetPosition { x, y } => {
                self.ctx.x = x;
                self.ctx.y = y;
            }
            MotionOp::ModeDefault => self.to_default_mode(),
            MotionOp::ModeConcat => self.to_concat_mode(),
            MotionOp::ModeCompact => self.to_compact_mode(),
            MotionOp::Wait { seconds } => {
                if let Ok(duration) = Duration::try_from_secs_f64(seconds) {
                    // A partial line never leaves the controller buffer
                    self.to_default_mode();
                    self.out.notify(DriverEvent::Wait(duration));
                }
            }
            MotionOp::WaitBufferEmpty => {
                self.to_default_mode();
                self.out.write(WAIT_FINISH);
            }
            MotionOp::Reset => self.reset(),
            MotionOp::Pause => self.out.realtime_write(PAUSE),
            MotionOp::Resume => self.out.realtime_write(RESUME),
            MotionOp::Function(f) => (f.0)(),
            MotionOp::Console { command } => self.out.notify(DriverEvent::Console(command)),
            MotionOp::Beep => self.out.notify(DriverEvent::Beep),
            MotionOp::Status => {
                let report = self.ctx.status();
                self.out.notify(DriverEvent::Status(report));
            }
        }
        Ok(())
    }

    fn target(&self, x: i32, y: i32) -> (i32, i32) {
        if self.ctx.incremental {
            (self.ctx.x + x, self.ctx.y + y)
        } else {
            (x, y)
        }
    }

    fn emit_code(&mut self, code: u8) {
        self.out.write(&[code]);
    }

    fn end_rapid_command(&mut self) {
        self.out.write(FINISH_TO_RAPID);
        if !self.ctx.autolock {
            self.out.write(UNLOCK_RAIL);
        }
    }

    // === Modes ===

    /// Return to RAPID
    pub fn to_default_mode(&mut self) {
        match self.ctx.mode {
            InterpreterMode::Rapid => return,
            InterpreterMode::Finish => self.end_rapid_command(),
            InterpreterMode::Program => {
                self.out.write(PROGRAM_TO_RAPID);
                self.ctx.laser_on = false;
                self.ctx.flags = DirectionFlags::empty();
            }
        }
        debug!("Interpreter mode {:?} -> Rapid", self.ctx.mode);
        self.ctx.mode = InterpreterMode::Rapid;
    }

    /// Enter FINISH
    pub fn to_concat_mode(&mut self) {
        match self.ctx.mode {
            InterpreterMode::Finish => return,
            InterpreterMode::Rapid => self.out.write(ENTER_FINISH),
            InterpreterMode::Program => {
                self.out.write(PROGRAM_TO_FINISH);
                self.ctx.laser_on = false;
                self.ctx.flags = DirectionFlags::empty();
            }
        }
        debug!("Interpreter mode {:?} -> Finish", self.ctx.mode);
        self.ctx.mode = InterpreterMode::Finish;
    }

    /// Enter PROGRAM, sending the speed code for the current settings
    pub fn to_compact_mode(&mut self) {
        match self.ctx.mode {
            InterpreterMode::Program => return,
            InterpreterMode::Rapid => self.to_concat_mode(),
            InterpreterMode::Finish => {}
        }
        let code = self.ctx.speed_code().encode();
        debug!("Entering program mode with speed code {}", code);
        self.out.write(code.as_bytes());
        self.out.write(b"N");
        self.declare_directions();
        self.out.write(PROGRAM_START);
        self.ctx.mode = InterpreterMode::Program;
    }

    /// Declare X and Y directions; the axis with momentum goes last
    fn declare_directions(&mut self) {
        let flags = self.ctx.flags;
        let x_dir = if flags.contains(DirectionFlags::LEFT) {
            CODE_LEFT
        } else {
            CODE_RIGHT
        };
        let y_dir = if flags.contains(DirectionFlags::TOP) {
            CODE_TOP
        } else {
            CODE_BOTTOM
        };
        if flags.contains(DirectionFlags::X_MOMENTUM) {
            self.out.write(&[y_dir, x_dir]);
        } else {
            self.out.write(&[x_dir, y_dir]);
        }
    }

    // === Laser ===

    /// Returns whether anything was sent
    pub fn laser_on(&mut self) -> bool {
        if self.ctx.laser_on {
            return false;
        }
        match self.ctx.mode {
            InterpreterMode::Rapid => {
                self.out.write(ENTER_FINISH);
                self.emit_code(CODE_ON);
                self.end_rapid_command();
            }
            InterpreterMode::Program => self.emit_code(CODE_ON),
            InterpreterMode::Finish => {
                self.emit_code(CODE_ON);
                self.out.write(b"N");
            }
        }
        self.ctx.laser_on = true;
        true
    }

    /// Returns whether anything was sent
    pub fn laser_off(&mut self) -> bool {
        if !self.ctx.laser_on {
            return false;
        }
        match self.ctx.mode {
            InterpreterMode::Rapid => {
                self.out.write(ENTER_FINISH);
                self.emit_code(CODE_OFF);
                self.end_rapid_command();
            }
            InterpreterMode::Program => self.emit_code(CODE_OFF),
            InterpreterMode::Finish => {
                self.emit_code(CODE_OFF);
                self.out.write(b"N");
            }
        }
        self.ctx.laser_on = false;
        true
    }

    // === Settings ===

    pub fn set_speed(&mut self, speed: f64) {
        if self.ctx.speed != speed {
            self.ctx.speed = speed;
            self.refresh_program_mode();
        }
    }

    pub fn set_power(&mut self, power: f64) {
        self.ctx.power = if power.is_nan() {
            0.0
        } else {
            power.clamp(0.0, MAX_POWER)
        };
    }

    pub fn set_step(&mut self, step: u32) {
        if self.ctx.raster_step != step {
            self.ctx.raster_step = step;
            self.refresh_program_mode();
        }
    }

    pub fn set_d_ratio(&mut self, d_ratio: Option<f64>) {
        if self.ctx.d_ratio != d_ratio {
            self.ctx.d_ratio = d_ratio;
            self.refresh_program_mode();
        }
    }

    // Speed settings only take effect when PROGRAM is entered
    fn refresh_program_mode(&mut self) {
        if self.ctx.mode == InterpreterMode::Program {
            self.to_concat_mode();
            self.to_compact_mode();
        }
    }

    // === Direction state ===

    fn is_left(&self) -> bool {
        let f = self.ctx.flags;
        f.contains(DirectionFlags::X_MOMENTUM | DirectionFlags::LEFT)
            && !f.contains(DirectionFlags::Y_MOMENTUM)
    }

    fn is_right(&self) -> bool {
        let f = self.ctx.flags;
        f.contains(DirectionFlags::X_MOMENTUM)
            && !f.intersects(DirectionFlags::Y_MOMENTUM | DirectionFlags::LEFT)
    }

    fn is_top(&self) -> bool {
        let f = self.ctx.flags;
        f.contains(DirectionFlags::Y_MOMENTUM | DirectionFlags::TOP)
            && !f.contains(DirectionFlags::X_MOMENTUM)
    }

    fn is_bottom(&self) -> bool {
        let f = self.ctx.flags;
        f.contains(DirectionFlags::Y_MOMENTUM)
            && !f.intersects(DirectionFlags::X_MOMENTUM | DirectionFlags::TOP)
    }

    fn in_program(&self) -> bool {
        self.ctx.mode == InterpreterMode::Program
    }

    // === Axis moves ===

    pub fn move_x(&mut self, dx: i32) {
        if dx > 0 {
            self.move_right(dx);
        } else {
            self.move_left(dx);
        }
    }

    pub fn move_y(&mut self, dy: i32) {
        if dy > 0 {
            self.move_bottom(dy);
        } else {
            self.move_top(dy);
        }
    }

    fn move_right(&mut self, dx: i32) {
        self.ctx.x += dx;
        if !self.is_right() || !self.in_program() {
            self.emit_code(CODE_RIGHT);
            self.ctx.flags.remove(DirectionFlags::LEFT | DirectionFlags::Y_MOMENTUM);
            self.ctx.flags.insert(DirectionFlags::X_MOMENTUM);
        }
        self.emit_distance(dx);
    }

    fn move_left(&mut self, dx: i32) {
        self.ctx.x += dx;
        if !self.is_left() || !self.in_program() {
            self.emit_code(CODE_LEFT);
            self.ctx.flags.remove(DirectionFlags::Y_MOMENTUM);
            self.ctx.flags.insert(DirectionFlags::LEFT | DirectionFlags::X_MOMENTUM);
        }
        self.emit_distance(dx);
    }

    fn move_bottom(&mut self, dy: i32) {
        self.ctx.y += dy;
        if !self.is_bottom() || !self.in_program() {
            self.emit_code(CODE_BOTTOM);
            self.ctx.flags.remove(DirectionFlags::TOP | DirectionFlags::X_MOMENTUM);
            self.ctx.flags.insert(DirectionFlags::Y_MOMENTUM);
        }
        self.emit_distance(dy);
    }

    fn move_top(&mut self, dy: i32) {
        self.ctx.y += dy;
        if !self.is_top() || !self.in_program() {
            self.emit_code(CODE_TOP);
            self.ctx.flags.remove(DirectionFlags::X_MOMENTUM);
            self.ctx.flags.insert(DirectionFlags::TOP | DirectionFlags::Y_MOMENTUM);
        }
        self.emit_distance(dy);
    }

    fn emit_distance(&mut self, delta: i32) {
        if delta != 0 {
            self.out.write(&lhymicro_distance(delta.unsigned_abs()));
            self.ctx.check_bounds();
        }
    }

    /// 45 degree move; |dx| must equal |dy|
    pub fn move_angle(&mut self, dx: i32, dy: i32) -> Result<()> {
        if dx.abs() != dy.abs() {
            return Err(MotionError::DiagonalMismatch { dx, dy });
        }
        self.ctx.x += dx;
        self.ctx.y += dy;
        let flags = self.ctx.flags;
        if dx < 0 && !flags.contains(DirectionFlags::LEFT) {
            self.emit_code(CODE_LEFT);
            self.ctx.flags.insert(DirectionFlags::LEFT);
        } else if dx > 0 && flags.contains(DirectionFlags::LEFT) {
            self.emit_code(CODE_RIGHT);
            self.ctx.flags.remove(DirectionFlags::LEFT);
        }
        if dy < 0 && !flags.contains(DirectionFlags::TOP) {
            self.emit_code(CODE_TOP);
            self.ctx.flags.insert(DirectionFlags::TOP);
        } else if dy > 0 && flags.contains(DirectionFlags::TOP) {
            self.emit_code(CODE_BOTTOM);
            self.ctx.flags.remove(DirectionFlags::TOP);
        }
        self.ctx.flags.insert(DirectionFlags::X_MOMENTUM | DirectionFlags::Y_MOMENTUM);
        self.emit_code(CODE_ANGLE);
        self.out.write(&lhymicro_distance(dy.unsigned_abs()));
        self.ctx.check_bounds();
        Ok(())
    }

    /// One grouped run: horizontal, vertical or diagonal
    fn goto_octant(&mut self, dx: i32, dy: i32, on: bool) -> Result<()> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        if on {
            self.laser_on();
        } else {
            self.laser_off();
        }
        if dx.abs() == dy.abs() {
            self.move_angle(dx, dy)
        } else if dx == 0 {
            self.move_y(dy);
            Ok(())
        } else if dy == 0 {
            self.move_x(dx);
            Ok(())
        } else {
            Err(MotionError::GeometryViolation { dx, dy })
        }
    }

    /// Laser-off relative move in the current mode
    fn travel(&mut self, dx: i32, dy: i32) -> Result<()> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        match self.ctx.mode {
            InterpreterMode::Rapid => {
                self.out.write(ENTER_FINISH);
                if dx != 0 {
                    self.move_x(dx);
                }
                if dy != 0 {
                    self.move_y(dy);
                }
                self.end_rapid_command();
            }
            InterpreterMode::Program => {
                let (x, y) = (self.ctx.x, self.ctx.y);
                let steps = plot_line(x, y, x + dx, y + dy)
                    .into_iter()
                    .map(|(px, py)| PlotPoint::new(px, py, 0.0))
                    .collect();
                self.plot_steps(steps, false)?;
            }
            InterpreterMode::Finish => {
                if dx != 0 {
                    self.move_x(dx);
                }
                if dy != 0 {
                    self.move_y(dy);
                }
                self.out.write(b"N");
            }
        }
        Ok(())
    }

    fn plot_steps(&mut self, steps: Vec<PlotPoint>, group: bool) -> Result<()> {
        self.ctx.pulse.group = group;
        let runs = group_plots(
            self.ctx.x,
            self.ctx.y,
            steps,
            self.ctx.power,
            &mut self.ctx.pulse,
        )?;
        for run in runs {
            self.goto_octant(run.dx(), run.dy(), run.on)?;
        }
        Ok(())
    }

    // === Raster ===

    /// Step to the next horizontal scan line, reversing X
    pub fn h_switch(&mut self) {
        if self.ctx.flags.contains(DirectionFlags::LEFT) {
            self.emit_code(CODE_RIGHT);
            self.ctx.flags.remove(DirectionFlags::LEFT);
        } else {
            self.emit_code(CODE_LEFT);
            self.ctx.flags.insert(DirectionFlags::LEFT);
        }
        let step = self.ctx.raster_step as i32;
        if self.ctx.flags.contains(DirectionFlags::TOP) {
            self.ctx.y -= step;
        } else {
            self.ctx.y += step;
        }
        self.ctx.laser_on = false;
        self.ctx.check_bounds();
    }

    /// Step to the next vertical scan line, reversing Y
    pub fn v_switch(&mut self) {
        if self.ctx.flags.contains(DirectionFlags::TOP) {
            self.emit_code(CODE_BOTTOM);
            self.ctx.flags.remove(DirectionFlags::TOP);
        } else {
            self.emit_code(CODE_TOP);
            self.ctx.flags.insert(DirectionFlags::TOP);
        }
        let step = self.ctx.raster_step as i32;
        if self.ctx.flags.contains(DirectionFlags::LEFT) {
            self.ctx.x -= step;
        } else {
            self.ctx.x += step;
        }
        self.ctx.laser_on = false;
        self.ctx.check_bounds();
    }

    fn raster(&mut self, image: &RasterImage) -> Result<()> {
        let columns = image.rows.iter().map(Vec::len).max().unwrap_or(0);
        if columns == 0 || image.step == 0 {
            return Ok(());
        }
        let step = image.step as i32;
        let width = columns as i32 * step;
        let previous_step = self.ctx.raster_step;

        self.to_default_mode();
        self.travel(image.x - self.ctx.x, image.y - self.ctx.y)?;
        self.ctx.flags = if image.horizontal {
            DirectionFlags::X_MOMENTUM
        } else {
            DirectionFlags::Y_MOMENTUM
        };
        self.ctx.raster_step = image.step;
        self.ctx.pulse.reset();
        self.to_compact_mode();

        let mut forward = true;
        for (line, row) in image.rows.iter().enumerate() {
            let (sx, sy) = (self.ctx.x, self.ctx.y);
            let steps = (1..=width)
                .map(|i| {
                    let pixel = if forward { (i - 1) / step } else { (width - i) / step };
                    let on = row.get(pixel as usize).copied().unwrap_or(0.0);
                    let offset = if forward { i } else { -i };
                    if image.horizontal {
                        PlotPoint::new(sx + offset, sy, on)
                    } else {
                        PlotPoint::new(sx, sy + offset, on)
                    }
                })
                .collect();
            self.plot_steps(steps, true)?;
            if line + 1 < image.rows.len() {
                if image.horizontal {
                    self.h_switch();
                } else {
                    self.v_switch();
                }
            }
            forward = !forward;
        }

        self.laser_off();
        self.to_default_mode();
        self.ctx.raster_step = previous_step;
        Ok(())
    }

    // === Device commands ===

    fn home(&mut self) {
        self.to_default_mode();
        self.out.write(HOME);
        self.ctx.x = 0;
        self.ctx.y = 0;
        self.ctx.flags = DirectionFlags::empty();
        self.ctx.laser_on = false;
    }

    fn reset(&mut self) {
        self.out.realtime_write(RESET);
        self.ctx.mode = InterpreterMode::Rapid;
        self.ctx.flags = DirectionFlags::empty();
        self.ctx.laser_on = false;
        self.ctx.pulse.reset();
    }
}

fn lit(steps: Vec<(i32, i32)>) -> Vec<PlotPoint> {
    steps
        .into_iter()
        .map(|(x, y)| PlotPoint::new(x, y, 1.0))
        .collect()
}
