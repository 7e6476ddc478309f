// Lhystudios (M2 Nano and relatives) protocol stack
//
// Provides:
// - Speed code encoding/decoding per board and gear
// - Motion op interpreter producing Lhymicro-GL bytes
// - Packet framing with CRC
// - Transport state machine driving a USB backend

pub mod controller;
pub mod distance;
pub mod interpreter;
pub mod ops;
pub mod packet;
pub mod plot;
pub mod speed;
pub mod usb;

pub use controller::{Controller, ControllerEvent, ControllerState, ControllerStats};
pub use distance::lhymicro_distance;
pub use interpreter::{InterpreterContext, InterpreterMode, MotionEncoder, StatusReport, apply};
pub use ops::{ByteSink, DriverEvent, MotionOp, OpFunction, PlotPoint, RasterImage};
pub use packet::{Frame, assemble, crc8};
pub use plot::{MotionError, group_plots};
pub use speed::{Board, SpeedCode, SpeedCodeError};
pub use usb::{SimulatedBoard, TransportError, UsbDriver};
