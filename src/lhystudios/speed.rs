// Speed codes for Lhystudios controller boards
//
// The board clocks every step from a 16-bit down-counter. A speed is sent as
// the counter reload value:
//   value = 65536 - round(m * period_ms + b)
// where period_ms = 25.4 / (mm/s) and (b, m) come from a per-board, per-gear
// table.
//
// Grammar:
//   vector: ["C"] "V" value gear [step diagonal] ["C"]
//   raster: "V" value gear "G" raster_step

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DEFAULT_D_RATIO;

pub const MAX_VECTOR_SPEED: f64 = 240.0;
pub const MAX_RASTER_SPEED: f64 = 500.0;

/// Vector speeds above `MAX_VECTOR_SPEED` are replaced by this value rather
/// than clamped. Stock software behaves the same way.
pub const OVERSPEED_FALLBACK: f64 = 19.05;

/// Correction for boards that run about 8% fast
pub const FIX_SPEEDS_RATIO: f64 = 0.919493599053179;

const MM_PER_INCH: f64 = 25.4;
const MAX_STEP_VALUE: u32 = 128;

/// Mask applied to `value >> 8` when printing the high byte.
///
/// The stock tooling shifted a signed int without narrowing it, so negative
/// values print as 8-digit numbers close to 2^24. Boards accept these codes as
/// sent. Do not narrow this mask to 0xFF.
const HIGH_BYTE_MASK: i64 = 0xFF_FFFF;
const WRAP_THRESHOLD: i64 = 16_000_000;
const WRAP_MODULUS: i64 = 16_777_216;

// A wrapped (negative) value occupies 8 + 3 digits instead of 3 + 3
const WIDE_VALUE_DIGITS: usize = 11;
const NARROW_VALUE_DIGITS: usize = 6;

/// Error types for speed code handling
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpeedCodeError {
    #[error("Unknown board: {0}")]
    UnknownBoard(String),

    #[error("Invalid speed code {code:?}: {reason}")]
    InvalidCode { code: String, reason: String },
}

pub type Result<T> = std::result::Result<T, SpeedCodeError>;

/// Known controller boards.
///
/// `LASER-` variants share the gearing of their base board but always carry
/// the diagonal correction trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Board {
    A,
    B,
    B1,
    B2,
    M,
    M1,
    M2,
    #[serde(rename = "LASER-A")]
    LaserA,
    #[serde(rename = "LASER-B")]
    LaserB,
    #[serde(rename = "LASER-B1")]
    LaserB1,
    #[serde(rename = "LASER-B2")]
    LaserB2,
    #[serde(rename = "LASER-M")]
    LaserM,
    #[serde(rename = "LASER-M1")]
    LaserM1,
    #[serde(rename = "LASER-M2")]
    LaserM2,
}

impl Board {
    pub const ALL: [Board; 14] = [
        Board::A,
        Board::B,
        Board::B1,
        Board::B2,
        Board::M,
        Board::M1,
        Board::M2,
        Board::LaserA,
        Board::LaserB,
        Board::LaserB1,
        Board::LaserB2,
        Board::LaserM,
        Board::LaserM1,
        Board::LaserM2,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Board::A => "A",
            Board::B => "B",
            Board::B1 => "B1",
            Board::B2 => "B2",
            Board::M => "M",
            Board::M1 => "M1",
            Board::M2 => "M2",
            Board::LaserA => "LASER-A",
            Board::LaserB => "LASER-B",
            Board::LaserB1 => "LASER-B1",
            Board::LaserB2 => "LASER-B2",
            Board::LaserM => "LASER-M",
            Board::LaserM1 => "LASER-M1",
            Board::LaserM2 => "LASER-M2",
        }
    }

    /// Base board without the `LASER-` prefix
    pub fn family(self) -> Board {
        match self {
            Board::LaserA => Board::A,
            Board::LaserB => Board::B,
            Board::LaserB1 => Board::B1,
            Board::LaserB2 => Board::B2,
            Board::LaserM => Board::M,
            Board::LaserM1 => Board::M1,
            Board::LaserM2 => Board::M2,
            other => other,
        }
    }

    /// Whether vector speed codes carry the step/diagonal trailer
    pub fn supports_diagonal(self) -> bool {
        !matches!(self, Board::A | Board::B | Board::M)
    }

    /// Slowest speed the board can time without the counter wrapping
    pub fn min_speed(self, uses_raster: bool) -> f64 {
        match (self.family(), uses_raster) {
            (Board::A | Board::B | Board::M, false) => 0.8,
            (Board::A | Board::B | Board::M, true) => 2.0,
            (_, false) => 0.4,
            (_, true) => 1.0,
        }
    }
}

impl fmt::Display for Board {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Board {
    type Err = SpeedCodeError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Board::ALL
            .into_iter()
            .find(|board| board.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| SpeedCodeError::UnknownBoard(s.to_string()))
    }
}

/// Linear coefficients for one gear: value = 65536 - round(m * period_ms + b)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gearing {
    pub b: f64,
    pub m: f64,
    pub gear: u8,
}

/// Pick the gear for a speed.
///
/// Every board reports the gear digit; A, B and M only share one set of
/// coefficients across gears.
pub fn gear_for_speed(mm_per_second: f64, uses_raster: bool, _board: Board) -> u8 {
    if mm_per_second <= 25.4 {
        1
    } else if mm_per_second <= 60.0 {
        2
    } else if mm_per_second <= 127.0 {
        if uses_raster { 3 } else { 2 }
    } else if mm_per_second <= 320.0 {
        3
    } else {
        4
    }
}

/// Coefficient table. Gear 0 is the short "C"-suffixed form of gear 1.
pub fn gearing(board: Board, gear: u8) -> Gearing {
    let gear = gear.min(4);
    let (b, m) = match board.family() {
        Board::A | Board::B | Board::M => (784.0, 2000.0),
        Board::B1 | Board::M1 => match gear {
            0 | 1 => (784.0, 1010.0),
            2 => (5120.0, 11148.0),
            3 => (5632.0, 11148.0),
            _ => (6144.0, 11148.0),
        },
        _ => match gear {
            0 | 1 => (8.0, 1010.0),
            2 => (5120.0, 12120.0),
            3 => (5632.0, 12120.0),
            _ => (6144.0, 12120.0),
        },
    };
    Gearing { b, m, gear }
}

fn period_ms(mm_per_second: f64) -> f64 {
    if mm_per_second > 0.0 {
        MM_PER_INCH / mm_per_second
    } else {
        0.0
    }
}

fn value_from_period(period_ms: f64, gearing: Gearing) -> i64 {
    65536 - (gearing.m * period_ms + gearing.b).round() as i64
}

/// Speed in mm/s for a counter value; non-positive periods read as 0
pub fn speed_from_value(value: i64, gearing: Gearing) -> f64 {
    let period = ((65536 - value) as f64 - gearing.b) / gearing.m;
    if period > 0.0 { MM_PER_INCH / period } else { 0.0 }
}

/// Steps per diagonal correction, capped at 128
fn step_value(mm_per_second: f64) -> u32 {
    ((mm_per_second.floor() as u32) + 1).min(MAX_STEP_VALUE)
}

/// Render a counter value as high byte then low byte, three digits each
pub fn encode_value(value: i64) -> String {
    let b0 = value & 0xFF;
    let b1 = (value >> 8) & HIGH_BYTE_MASK;
    format!("{:03}{:03}", b1, b0)
}

/// Inverse of [`encode_value`], unwrapping the 24-bit negatives.
///
/// High bytes above 0x7FFF that are not wrapped negatives fold back by 0xFFFF,
/// so values at or above 0x800000 do not survive a round trip.
pub fn decode_value(code: &str) -> Result<i64> {
    let invalid = |reason: &str| SpeedCodeError::InvalidCode {
        code: code.to_string(),
        reason: reason.to_string(),
    };
    if code.len() < 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid("encoded value needs at least four digits"));
    }
    let (high, low) = code.split_at(code.len() - 3);
    let mut b1: i64 = high.parse().map_err(|_| invalid("high byte out of range"))?;
    let b0: i64 = low.parse().map_err(|_| invalid("low byte out of range"))?;
    if b0 > 0xFF {
        return Err(invalid("low byte out of range"));
    }
    if b1 > WRAP_THRESHOLD {
        b1 -= WRAP_MODULUS;
    }
    if b1 > 0x7FFF {
        b1 -= 0xFFFF;
    }
    Ok((b1 << 8) + b0)
}

/// Clamp a speed to what the board can run
pub fn validate_speed(mm_per_second: f64, board: Board, uses_raster: bool) -> f64 {
    let min = board.min_speed(uses_raster);
    let max = if uses_raster {
        MAX_RASTER_SPEED
    } else {
        MAX_VECTOR_SPEED
    };
    if mm_per_second.is_nan() {
        return min;
    }
    mm_per_second.clamp(min, max)
}

/// Speed code request for one board
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedCode {
    pub board: Board,
    pub speed: f64,
    pub raster_step: u32,
    pub d_ratio: Option<f64>,
    pub gear: Option<u8>,
    pub fix_speeds: bool,
}

impl SpeedCode {
    pub fn new(board: Board, speed: f64) -> Self {
        Self {
            board,
            speed,
            raster_step: 0,
            d_ratio: None,
            gear: None,
            fix_speeds: false,
        }
    }

    pub fn raster_step(mut self, raster_step: u32) -> Self {
        self.raster_step = raster_step;
        self
    }

    pub fn d_ratio(mut self, d_ratio: Option<f64>) -> Self {
        self.d_ratio = d_ratio;
        self
    }

    /// Force a gear instead of choosing one from the speed
    pub fn gear(mut self, gear: Option<u8>) -> Self {
        self.gear = gear;
        self
    }

    pub fn fix_speeds(mut self, fix_speeds: bool) -> Self {
        self.fix_speeds = fix_speeds;
        self
    }

    /// Speed actually encoded, after the overspeed and range rules
    pub fn effective_speed(&self) -> f64 {
        let speed = if self.raster_step == 0 {
            if self.speed > MAX_VECTOR_SPEED {
                OVERSPEED_FALLBACK
            } else {
                self.speed
            }
        } else {
            self.speed.min(MAX_RASTER_SPEED)
        };
        let speed = speed.max(0.0);
        if self.fix_speeds {
            speed * FIX_SPEEDS_RATIO
        } else {
            speed
        }
    }

    pub fn encode(&self) -> String {
        let speed = self.effective_speed();
        let uses_raster = self.raster_step != 0;
        let gear = self
            .gear
            .map(|g| g.min(4))
            .unwrap_or_else(|| gear_for_speed(speed, uses_raster, self.board));
        let gearing = gearing(self.board, gear);
        let period = period_ms(speed);
        let code = encode_value(value_from_period(period, gearing));
        let gear_digit = if gear == 0 { 1 } else { gear };

        if uses_raster {
            return format!("V{}{}G{:03}", code, gear_digit, self.raster_step);
        }
        if !self.board.supports_diagonal() {
            return if gear == 0 {
                format!("CV{}1C", code)
            } else {
                format!("CV{}{}", code, gear)
            };
        }

        let step = step_value(speed);
        let d_ratio = self.d_ratio.unwrap_or(DEFAULT_D_RATIO);
        let diagonal = d_ratio * gearing.m * period / step as f64;
        let suffix = if gear == 0 { "C" } else { "" };
        format!(
            "CV{}{}{:03}{}{}",
            code,
            gear_digit,
            step,
            encode_value(diagonal as i64),
            suffix
        )
    }
}

impl fmt::Display for SpeedCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Encode a speed for a board
pub fn encode(
    mm_per_second: f64,
    raster_step: u32,
    board: Board,
    d_ratio: Option<f64>,
    gear: Option<u8>,
) -> String {
    SpeedCode::new(board, mm_per_second)
        .raster_step(raster_step)
        .d_ratio(d_ratio)
        .gear(gear)
        .encode()
}

/// Fields recovered from a speed code
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedSpeed {
    pub speed: f64,
    pub raster_step: u32,
    pub gear: u8,
    pub step_value: Option<u32>,
    pub diagonal: Option<i64>,
    pub prefix_c: bool,
    pub suffix_c: bool,
}

fn parse_digits(code: &str, digits: &str, what: &str) -> Result<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SpeedCodeError::InvalidCode {
            code: code.to_string(),
            reason: format!("{} is not numeric: {:?}", what, digits),
        });
    }
    digits.parse().map_err(|_| SpeedCodeError::InvalidCode {
        code: code.to_string(),
        reason: format!("{} out of range", what),
    })
}

/// Parse a speed code back into mm/s and its trailer fields
pub fn decode(code: &str, board: Board) -> Result<DecodedSpeed> {
    let invalid = |reason: &str| SpeedCodeError::InvalidCode {
        code: code.to_string(),
        reason: reason.to_string(),
    };
    if !code.is_ascii() {
        return Err(invalid("non-ASCII characters"));
    }

    let mut body = code;
    let prefix_c = body.starts_with('C');
    if prefix_c {
        body = &body[1..];
    }
    let suffix_c = body.ends_with('C');
    if suffix_c {
        body = &body[..body.len() - 1];
    }
    body = body.strip_prefix('V').ok_or_else(|| invalid("missing V"))?;

    let mut raster_step = 0;
    if let Some(pos) = body.find('G') {
        let step = &body[pos + 1..];
        if step.len() != 3 {
            return Err(invalid("raster step must be three digits"));
        }
        raster_step = parse_digits(code, step, "raster step")?;
        body = &body[..pos];
    }

    // Wrapped negatives start "167" and leave a trailer of 0, 1 or 10 digits
    let wide = body.starts_with("167")
        && matches!(body.len().checked_sub(WIDE_VALUE_DIGITS), Some(0 | 1 | 10));
    let value_len = if wide {
        WIDE_VALUE_DIGITS
    } else {
        NARROW_VALUE_DIGITS
    };
    if body.len() < value_len {
        return Err(invalid("speed value too short"));
    }
    let (value_digits, mut rest) = body.split_at(value_len);
    let value = decode_value(value_digits)?;

    let mut gear = 1;
    if let Some(digit) = rest.chars().next() {
        gear = digit
            .to_digit(10)
            .filter(|g| *g <= 4)
            .ok_or_else(|| invalid("gear must be a digit 0-4"))? as u8;
        rest = &rest[1..];
    }

    let (step_value, diagonal) = if rest.is_empty() {
        (None, None)
    } else {
        if rest.len() < 3 {
            return Err(invalid("truncated step value"));
        }
        let step = parse_digits(code, &rest[..3], "step value")?;
        let diagonal = &rest[3..];
        let diagonal = if diagonal.is_empty() {
            None
        } else {
            Some(decode_value(diagonal)?)
        };
        (Some(step), diagonal)
    };

    if suffix_c {
        gear = 0;
    }
    let speed = speed_from_value(value, gearing(board, gear));

    Ok(DecodedSpeed {
        speed,
        raster_step,
        gear,
        step_value,
        diagonal,
        prefix_c,
        suffix_c,
    })
}
