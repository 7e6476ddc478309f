// Abstract motion operations consumed by the interpreter, and the sink it writes to

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::interpreter::StatusReport;

/// Callback run in stream order by `MotionOp::Function`
pub struct OpFunction(pub Box<dyn FnOnce() + Send>);

impl OpFunction {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Box::new(f))
    }
}

impl fmt::Debug for OpFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OpFunction(..)")
    }
}

/// One point of a plotted path; `on` is laser intensity in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    pub x: i32,
    pub y: i32,
    pub on: f64,
}

impl PlotPoint {
    pub fn new(x: i32, y: i32, on: f64) -> Self {
        Self { x, y, on }
    }
}

/// Raster image scanned line by line.
///
/// `rows[r][c]` is the intensity of the pixel at column `c` of line `r`. Each
/// pixel covers `step` device units along the scan, and lines are `step`
/// units apart. Scans run horizontally, or down columns when `horizontal` is
/// false, reversing direction every line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterImage {
    pub x: i32,
    pub y: i32,
    pub step: u32,
    #[serde(default = "default_horizontal")]
    pub horizontal: bool,
    pub rows: Vec<Vec<f64>>,
}

fn default_horizontal() -> bool {
    true
}

/// Operations understood by the interpreter
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MotionOp {
    LaserOn,
    LaserOff,
    RapidMove { x: i32, y: i32 },
    Move { x: i32, y: i32 },
    Cut { x: i32, y: i32 },
    CutQuad { cx: i32, cy: i32, x: i32, y: i32 },
    CutCubic { c1: (i32, i32), c2: (i32, i32), x: i32, y: i32 },
    Plot { points: Vec<PlotPoint> },
    Raster { image: RasterImage },
    HStep,
    VStep,
    Home,
    LockRail,
    UnlockRail,
    SetSpeed { speed: f64 },
    SetPower { power: f64 },
    SetStep { step: u32 },
    SetDRatio { d_ratio: Option<f64> },
    SetDirection { left: bool, top: bool, x_dir: bool, y_dir: bool },
    SetIncremental,
    SetAbsolute,
    SetPosition { x: i32, y: i32 },
    ModeDefault,
    ModeConcat,
    ModeCompact,
    Wait { seconds: f64 },
    WaitBufferEmpty,
    Reset,
    Pause,
    Resume,
    #[serde(skip)]
    Function(OpFunction),
    Console { command: String },
    Beep,
    Status,
}

/// Side effects with no bytes on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    Wait(Duration),
    Beep,
    Console(String),
    Status(StatusReport),
}

/// Destination for interpreter output
pub trait ByteSink {
    /// Append to the normal queue
    fn write(&mut self, bytes: &[u8]);

    /// Append to the out-of-band queue, serviced before the normal one
    fn realtime_write(&mut self, bytes: &[u8]) {
        self.write(bytes);
    }

    fn notify(&mut self, _event: DriverEvent) {}
}

impl ByteSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl<S: ByteSink + ?Sized> ByteSink for &mut S {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes);
    }

    fn realtime_write(&mut self, bytes: &[u8]) {
        (**self).realtime_write(bytes);
    }

    fn notify(&mut self, event: DriverEvent) {
        (**self).notify(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_json_shape() {
        let op: MotionOp = serde_json::from_str(r#"{"op": "cut", "x": 100, "y": 50}"#)
            .expect("cut should parse");
        assert!(matches!(op, MotionOp::Cut { x: 100, y: 50 }));

        let op: MotionOp =
            serde_json::from_str(r#"{"op": "set_speed", "speed": 35.5}"#).expect("set_speed");
        assert!(matches!(op, MotionOp::SetSpeed { speed } if speed == 35.5));

        let op: MotionOp = serde_json::from_str(r#"{"op": "home"}"#).expect("home");
        assert!(matches!(op, MotionOp::Home));
    }

    #[test]
    fn test_raster_defaults_to_horizontal() {
        let op: MotionOp = serde_json::from_str(
            r#"{"op": "raster", "image": {"x": 0, "y": 0, "step": 2, "rows": [[1.0, 0.0]]}}"#,
        )
        .expect("raster should parse");
        match op {
            MotionOp::Raster { image } => {
                assert!(image.horizontal);
                assert_eq!(image.rows.len(), 1);
            }
            other => panic!("unexpected op {:?}", other),
        }
    }

    #[test]
    fn test_vec_sink_collects_both_queues() {
        let mut sink: Vec<u8> = Vec::new();
        sink.write(b"IB");
        sink.realtime_write(b"PN!\n");
        assert_eq!(sink, b"IBPN!\n");
    }
}
