// Packet framing for the Lhystudios USB link
//
// Wire format: [0x00, payload (30 bytes), crc8(payload)]
//
// The logical byte stream is cut into 30-byte payloads. A '\n' ends a packet
// early; the byte just before it may be a control character that is acted on
// instead of sent:
//   '-'  wait until the board finishes, after this packet is confirmed
//   '*'  abort buffered data, after this packet is confirmed
//   '&'  resume (leave BUSY)
//   '!'  pause (enter BUSY)
//   0x18 shut the controller down
//   '#'  pad by repeating the previous byte instead of 'F'

use tracing::trace;

pub const PAYLOAD_LEN: usize = 30;
pub const PACKET_LEN: usize = PAYLOAD_LEN + 2;

pub const PAD_BYTE: u8 = b'F';
pub const TERMINATOR: u8 = b'\n';

pub const CTRL_WAIT_FINISH: u8 = b'-';
pub const CTRL_ABORT: u8 = b'*';
pub const CTRL_RESUME: u8 = b'&';
pub const CTRL_PAUSE: u8 = b'!';
pub const CTRL_REPEAT_PAD: u8 = b'#';
pub const CTRL_QUIT: u8 = 0x18;

const CONTROL_SUFFIXES: [u8; 6] = [
    CTRL_WAIT_FINISH,
    CTRL_ABORT,
    CTRL_RESUME,
    CTRL_PAUSE,
    CTRL_REPEAT_PAD,
    CTRL_QUIT,
];

// Low-nibble half, then high-nibble half. Must match the board firmware.
const CRC_TABLE: [u8; 32] = [
    0x00, 0x5E, 0xBC, 0xE2, 0x61, 0x3F, 0xDD, 0x83, 0xC2, 0x9C, 0x7E, 0x20, 0xA3, 0xFD, 0x1F, 0x41,
    0x00, 0x9D, 0x23, 0xBE, 0x46, 0xDB, 0x65, 0xF8, 0x8C, 0x11, 0xAF, 0x32, 0xCA, 0x57, 0xE9, 0x74,
];

/// One-wire style CRC8 over a payload
pub fn crc8(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |crc, &byte| {
        CRC_TABLE[(crc & 0x0F) as usize] ^ CRC_TABLE[16 + ((crc >> 4) & 0x0F) as usize] ^ byte
    })
}

/// Wrap a 30-byte payload with the leading zero and trailing CRC
pub fn build_packet(payload: &[u8; PAYLOAD_LEN]) -> [u8; PACKET_LEN] {
    let mut packet = [0u8; PACKET_LEN];
    packet[1..=PAYLOAD_LEN].copy_from_slice(payload);
    packet[PACKET_LEN - 1] = crc8(payload);
    packet
}

/// Action to run once the packet has been confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostSend {
    WaitFinished,
    Abort,
}

/// Action to run as soon as the packet is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Immediate {
    Resume,
    Pause,
    Shutdown,
}

/// A packet cut from the front of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Empty when the packet only carried control characters
    pub payload: Vec<u8>,
    /// Bytes to remove from the buffer once the frame is handled
    pub consumed: usize,
    pub post_send: Option<PostSend>,
    pub immediate: Option<Immediate>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Payload as a fixed-size array, if it is a full packet
    pub fn full_payload(&self) -> Option<&[u8; PAYLOAD_LEN]> {
        self.payload.as_slice().try_into().ok()
    }
}

/// Cut the next packet from the front of `buffer`.
///
/// Returns `None` when the buffer is empty or holds a partial packet that has
/// to wait for more bytes.
pub fn assemble(buffer: &[u8]) -> Option<Frame> {
    if buffer.is_empty() {
        return None;
    }
    let mut length = PAYLOAD_LEN.min(buffer.len());
    if let Some(pos) = buffer[..length].iter().position(|&b| b == TERMINATOR) {
        length = pos + 1;
    }

    let last = buffer[length - 1];
    if last != TERMINATOR && CONTROL_SUFFIXES.contains(&last) {
        // Control character cut off from its newline
        match buffer.get(length) {
            Some(&TERMINATOR) => length += 1,
            Some(_) => {}
            None => return None,
        }
    }

    let mut packet = buffer[..length].to_vec();
    if packet.last() != Some(&TERMINATOR) {
        if packet.len() < PAYLOAD_LEN {
            return None;
        }
        return Some(Frame {
            payload: packet,
            consumed: length,
            post_send: None,
            immediate: None,
        });
    }

    packet.pop();
    let mut post_send = None;
    let mut immediate = None;
    match packet.last() {
        Some(&CTRL_WAIT_FINISH) => post_send = Some(PostSend::WaitFinished),
        Some(&CTRL_ABORT) => post_send = Some(PostSend::Abort),
        Some(&CTRL_RESUME) => immediate = Some(Immediate::Resume),
        Some(&CTRL_PAUSE) => immediate = Some(Immediate::Pause),
        Some(&CTRL_QUIT) => immediate = Some(Immediate::Shutdown),
        _ => {}
    }
    if post_send.is_some() || immediate.is_some() {
        packet.pop();
    }

    if !packet.is_empty() {
        let pad = if packet.last() == Some(&CTRL_REPEAT_PAD) {
            packet.pop();
            packet.last().copied().unwrap_or(PAD_BYTE)
        } else {
            PAD_BYTE
        };
        packet.resize(PAYLOAD_LEN, pad);
    }
    trace!(
        "Framed {} bytes: {:?}",
        length,
        String::from_utf8_lossy(&packet)
    );

    Some(Frame {
        payload: packet,
        consumed: length,
        post_send,
        immediate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn padded(body: &str, pad: u8) -> Vec<u8> {
        let mut v = body.as_bytes().to_vec();
        v.resize(PAYLOAD_LEN, pad);
        v
    }

    #[test]
    fn test_crc_counting_payload() {
        let payload: Vec<u8> = (0u8..30).collect();
        assert_eq!(crc8(&payload), 0x9D);
        // A single flipped bit changes the checksum
        let mut flipped = payload.clone();
        flipped[29] ^= 0x01;
        assert_ne!(crc8(&flipped), 0x9D);
    }

    #[test]
    fn test_crc_known_payloads() {
        assert_eq!(crc8(&padded("IBa052", b'F')), 0x3E);
        assert_eq!(crc8(&padded("AK0", b'F')), 0x43);
    }

    #[test]
    fn test_build_packet_layout() {
        let payload: [u8; PAYLOAD_LEN] = padded("IBa052", b'F')
            .try_into()
            .expect("30 bytes");
        let packet = build_packet(&payload);
        assert_eq!(packet[0], 0x00);
        assert_eq!(&packet[1..31], &payload[..]);
        assert_eq!(packet[31], 0x3E);
    }

    #[test]
    fn test_short_line_is_padded() {
        let frame = assemble(b"IBa052\n").expect("newline completes the packet");
        assert_eq!(frame.payload, padded("IBa052", b'F'));
        assert_eq!(frame.consumed, 7);
        assert_eq!(frame.post_send, None);
        assert_eq!(frame.immediate, None);
    }

    #[test]
    fn test_long_buffer_takes_thirty_bytes() {
        let buffer = [b'B'; 40];
        let frame = assemble(&buffer).expect("full packet");
        assert_eq!(frame.consumed, 30);
        assert_eq!(frame.payload, vec![b'B'; 30]);
    }

    #[test]
    fn test_partial_packet_waits() {
        assert_eq!(assemble(b""), None);
        assert_eq!(assemble(b"IBa052"), None);
        // Control character still waiting for its newline
        assert_eq!(assemble(b"FNSE-"), None);
    }

    #[test]
    fn test_wait_finish_suffix() {
        let frame = assemble(b"FNSE-\nIPP\n").expect("packet");
        assert_eq!(frame.payload, padded("FNSE", b'F'));
        assert_eq!(frame.consumed, 6);
        assert_eq!(frame.post_send, Some(PostSend::WaitFinished));
    }

    #[test]
    fn test_control_only_packets() {
        let frame = assemble(b"-\n").expect("packet");
        assert!(frame.is_empty());
        assert_eq!(frame.post_send, Some(PostSend::WaitFinished));

        let frame = assemble(b"\x18\n").expect("packet");
        assert!(frame.is_empty());
        assert_eq!(frame.immediate, Some(Immediate::Shutdown));
    }

    #[test]
    fn test_realtime_sequences() {
        let frame = assemble(b"PN!\n").expect("packet");
        assert_eq!(frame.payload, padded("PN", b'F'));
        assert_eq!(frame.immediate, Some(Immediate::Pause));

        let frame = assemble(b"PN&\n").expect("packet");
        assert_eq!(frame.immediate, Some(Immediate::Resume));

        let frame = assemble(b"I*\n").expect("packet");
        assert_eq!(frame.payload, padded("I", b'F'));
        assert_eq!(frame.post_send, Some(PostSend::Abort));
    }

    #[test]
    fn test_repeat_pad() {
        let frame = assemble(b"AK0#\n").expect("packet");
        assert_eq!(frame.payload, padded("AK0", b'0'));
        assert_eq!(frame.consumed, 5);
    }

    #[test]
    fn test_control_suffix_pulls_newline() {
        // 29 bytes then '-' at index 29 and the newline at index 30
        let mut buffer = vec![b'B'; 29];
        buffer.extend_from_slice(b"-\nIPP\n");
        let frame = assemble(&buffer).expect("packet");
        assert_eq!(frame.consumed, 31);
        assert_eq!(frame.post_send, Some(PostSend::WaitFinished));
        assert_eq!(frame.payload, padded(&"B".repeat(29), b'F'));
    }

    #[test]
    fn test_control_byte_without_newline_is_plain() {
        let mut buffer = vec![b'B'; 29];
        buffer.extend_from_slice(b"-B");
        let frame = assemble(&buffer).expect("packet");
        assert_eq!(frame.consumed, 30);
        assert_eq!(frame.post_send, None);
        assert_eq!(frame.payload.last(), Some(&b'-'));
    }

    #[test]
    fn test_full_payload() {
        let frame = assemble(b"IBa052\n").expect("packet");
        assert!(frame.full_payload().is_some());
        let frame = assemble(b"-\n").expect("packet");
        assert!(frame.full_payload().is_none());
    }
}
