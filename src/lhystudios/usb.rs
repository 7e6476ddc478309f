// USB driver contract and a simulated board
//
// The real backend talks to the CH341 bridge in EPP 1.9 mode. Anything that
// can open a device by index, write 32-byte packets and read the 6-byte status
// block can stand in for it.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::packet::{PACKET_LEN, PAYLOAD_LEN, crc8};

/// Status codes reported in byte 1 of the status block
pub const STATUS_OK: u8 = 206; // 0xCE, packet accepted
pub const STATUS_BUSY: u8 = 238; // 0xEE
pub const STATUS_ERROR: u8 = 207; // 0xCF, CRC mismatch
pub const STATUS_FINISH: u8 = 236; // 0xEC
pub const STATUS_BAD_STATE: u8 = 204; // 0xCC
pub const STATUS_POWER: u8 = 239; // 0xEF, low power
pub const STATUS_NONE: u8 = 0; // read failed

/// Bit set while the board still has buffered work
pub const STATUS_BIT_PROCESSING: u8 = 0x02;

/// Human-readable name of a status code
pub fn status_name(code: u8) -> &'static str {
    match code {
        STATUS_OK => "OK",
        STATUS_BUSY => "Busy",
        STATUS_ERROR => "Rejected",
        STATUS_FINISH => "Finished",
        STATUS_BAD_STATE => "Bad state",
        STATUS_POWER => "Low power",
        STATUS_NONE => "No status",
        _ => "Unknown",
    }
}

/// Error types for the transport layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Could not open device {index}")]
    OpenFailure { index: usize },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Packet rejected by the board")]
    PacketRejected,

    #[error("No confirmation after {polls} status polls")]
    ConfirmationTimeout { polls: u32 },

    #[error("No USB driver available")]
    NoDevice,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Blocking USB backend, used only from the controller's worker thread
pub trait UsbDriver: Send {
    /// Open the device, returning the index actually opened.
    /// Fails with `OpenFailure` when the device is absent or busy.
    fn open(&mut self, index: usize) -> Result<usize>;

    fn close(&mut self, index: usize);

    /// Write one 32-byte packet
    fn write(&mut self, index: usize, packet: &[u8]) -> Result<()>;

    /// Read the 6-byte status block; byte 1 is the status code
    fn get_status(&mut self, index: usize) -> Result<[u8; 6]>;

    fn get_chip_version(&mut self, index: usize) -> Result<u32>;
}

/// Chip version the simulated board reports
pub const SIMULATED_CHIP_VERSION: u32 = 0x30;

/// Internal state of a simulated board
#[derive(Debug, Default)]
struct SimState {
    open: bool,
    open_attempts: u32,
    refuse_opens: u32,
    reject_writes: u32,
    fail_writes: u32,
    script: VecDeque<u8>,
    fixed_status: Option<u8>,
    written: bool,
    polls_since_write: u32,
    write_status: u8,
    payloads: Vec<Vec<u8>>,
    rejected: u32,
}

/// In-memory board that checks framing and CRC like the real hardware.
///
/// After a write the next status poll answers OK (or ERROR on a bad packet);
/// later polls answer FINISH, as if the board had worked through its buffer.
/// Clones share the same board, so a test can keep a handle for inspection.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `n` open attempts
    pub fn refuse_opens(&self, n: u32) {
        self.state.lock().refuse_opens = n;
    }

    /// Answer ERROR to the next `n` writes, as if their CRC failed
    pub fn reject_writes(&self, n: u32) {
        self.state.lock().reject_writes = n;
    }

    /// Fail the next `n` writes with an I/O error
    pub fn fail_writes(&self, n: u32) {
        self.state.lock().fail_writes = n;
    }

    /// Queue status codes returned before normal behaviour resumes
    pub fn script_status(&self, codes: impl IntoIterator<Item = u8>) {
        self.state.lock().script.extend(codes);
    }

    /// Report the same status code on every poll
    pub fn set_fixed_status(&self, code: Option<u8>) {
        self.state.lock().fixed_status = code;
    }

    /// Accepted payloads, in order
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.lock().payloads.clone()
    }

    pub fn open_attempts(&self) -> u32 {
        self.state.lock().open_attempts
    }

    pub fn rejected(&self) -> u32 {
        self.state.lock().rejected
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

impl UsbDriver for SimulatedBoard {
    fn open(&mut self, index: usize) -> Result<usize> {
        let mut state = self.state.lock();
        state.open_attempts += 1;
        if state.refuse_opens > 0 {
            state.refuse_opens -= 1;
            return Err(TransportError::OpenFailure { index });
        }
        state.open = true;
        state.written = false;
        state.polls_since_write = 0;
        Ok(index)
    }

    fn close(&mut self, _index: usize) {
        self.state.lock().open = false;
    }

    fn write(&mut self, _index: usize, packet: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::TransportFailure("device not open".into()));
        }
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(TransportError::TransportFailure("simulated write error".into()));
        }
        state.written = true;
        state.polls_since_write = 0;

        let framed = packet.len() == PACKET_LEN && packet[0] == 0x00;
        let payload = packet.get(1..=PAYLOAD_LEN).unwrap_or_default();
        let crc_ok = framed && packet[PACKET_LEN - 1] == crc8(payload);
        if !crc_ok || state.reject_writes > 0 {
            state.reject_writes = state.reject_writes.saturating_sub(1);
            state.rejected += 1;
            state.write_status = STATUS_ERROR;
            warn!("Simulated board rejected packet");
            return Ok(());
        }
        debug!(
            "Simulated board accepted {:?}",
            String::from_utf8_lossy(payload)
        );
        state.write_status = STATUS_OK;
        state.payloads.push(payload.to_vec());
        Ok(())
    }

    fn get_status(&mut self, _index: usize) -> Result<[u8; 6]> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::TransportFailure("device not open".into()));
        }
        let code = if let Some(code) = state.script.pop_front() {
            code
        } else if let Some(code) = state.fixed_status {
            code
        } else {
            let code = match (state.written, state.polls_since_write) {
                (false, _) => STATUS_OK,
                (true, 0) => state.write_status,
                (true, _) => STATUS_FINISH,
            };
            state.polls_since_write += 1;
            code
        };
        Ok([255, code, 0, 0, 0, 1])
    }

    fn get_chip_version(&mut self, _index: usize) -> Result<u32> {
        Ok(SIMULATED_CHIP_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lhystudios::packet::build_packet;

    fn packet(body: &str) -> [u8; PACKET_LEN] {
        let mut payload = [b'F'; PAYLOAD_LEN];
        payload[..body.len()].copy_from_slice(body.as_bytes());
        build_packet(&payload)
    }

    #[test]
    fn test_status_names() {
        assert_eq!(status_name(STATUS_OK), "OK");
        assert_eq!(status_name(STATUS_ERROR), "Rejected");
        assert_eq!(status_name(0x42), "Unknown");
    }

    #[test]
    fn test_simulated_board_accepts_valid_packet() {
        let mut board = SimulatedBoard::new();
        assert_eq!(board.open(0), Ok(0));
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_OK));
        board.write(0, &packet("IBa052")).expect("write");
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_OK));
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_FINISH));
        assert_eq!(board.payloads().len(), 1);
        assert!(board.payloads()[0].starts_with(b"IBa052F"));
    }

    #[test]
    fn test_simulated_board_rejects_bad_crc() {
        let mut board = SimulatedBoard::new();
        board.open(0).expect("open");
        let mut bad = packet("IBa052");
        bad[31] ^= 0xFF;
        board.write(0, &bad).expect("write");
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_ERROR));
        assert_eq!(board.rejected(), 1);
        assert!(board.payloads().is_empty());
    }

    #[test]
    fn test_simulated_board_refuses_opens() {
        let mut board = SimulatedBoard::new();
        board.refuse_opens(2);
        assert_eq!(board.open(3), Err(TransportError::OpenFailure { index: 3 }));
        assert_eq!(board.open(3), Err(TransportError::OpenFailure { index: 3 }));
        assert_eq!(board.open(3), Ok(3));
        assert_eq!(board.open_attempts(), 3);
    }

    #[test]
    fn test_scripted_status_comes_first() {
        let mut board = SimulatedBoard::new();
        board.open(0).expect("open");
        board.script_status([STATUS_BUSY, 0]);
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_BUSY));
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(0));
        assert_eq!(board.get_status(0).map(|s| s[1]), Ok(STATUS_OK));
    }
}
