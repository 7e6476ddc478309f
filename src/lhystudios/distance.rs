// Lhymicro-GL opcodes and distance encoding

/// Direction opcodes
pub const CODE_RIGHT: u8 = b'B';
pub const CODE_LEFT: u8 = b'T';
pub const CODE_TOP: u8 = b'L';
pub const CODE_BOTTOM: u8 = b'R';
pub const CODE_ANGLE: u8 = b'M';

/// Laser opcodes
pub const CODE_ON: u8 = b'D';
pub const CODE_OFF: u8 = b'U';

/// Mode sequences
pub const ENTER_FINISH: &[u8] = b"I";
pub const FINISH_TO_RAPID: &[u8] = b"S1P\n";
pub const UNLOCK_RAIL: &[u8] = b"IS2P\n";
pub const LOCK_RAIL: &[u8] = b"IS1P\n";
pub const PROGRAM_TO_RAPID: &[u8] = b"FNSE-\n";
pub const PROGRAM_TO_FINISH: &[u8] = b"@NSE";
pub const PROGRAM_START: &[u8] = b"S1E";
pub const HOME: &[u8] = b"IPP\n";

/// Realtime sequences
pub const PAUSE: &[u8] = b"PN!\n";
pub const RESUME: &[u8] = b"PN&\n";
pub const RESET: &[u8] = b"I*\n";
pub const WAIT_FINISH: &[u8] = b"-\n";

const Z_SPAN: u32 = 255;
const TABLE_SIZE: u32 = 52;

/// Encode a step count.
///
/// Whole multiples of 255 become repeated `z`; the remainder is three decimal
/// digits when it is 52 or more, otherwise a letter code: 1-25 are `a`-`y`,
/// 26-51 are `|a`-`|z`.
pub fn lhymicro_distance(mut v: u32) -> Vec<u8> {
    let mut out = Vec::new();
    if v >= Z_SPAN {
        out.resize((v / Z_SPAN) as usize, b'z');
        v %= Z_SPAN;
    }
    if v >= TABLE_SIZE {
        out.extend_from_slice(format!("{:03}", v).as_bytes());
    } else if v >= 26 {
        out.push(b'|');
        out.push(b'a' + (v - 26) as u8);
    } else if v >= 1 {
        out.push(b'a' + (v - 1) as u8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dist(v: u32) -> String {
        String::from_utf8(lhymicro_distance(v)).expect("distance codes are ASCII")
    }

    #[test]
    fn test_distance_table() {
        assert_eq!(dist(0), "");
        assert_eq!(dist(1), "a");
        assert_eq!(dist(25), "y");
        assert_eq!(dist(26), "|a");
        assert_eq!(dist(51), "|z");
        assert_eq!(dist(52), "052");
        assert_eq!(dist(100), "100");
        assert_eq!(dist(254), "254");
    }

    #[test]
    fn test_distance_z_prefix() {
        assert_eq!(dist(255), "z");
        assert_eq!(dist(256), "za");
        assert_eq!(dist(510), "zz");
        assert_eq!(dist(765), "zzz");
        assert_eq!(dist(255 + 30), "z|e");
        assert_eq!(dist(510 + 60), "zz060");
    }
}
