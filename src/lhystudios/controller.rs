// Transport state machine for a Lhystudios board
//
// Producers append to two queues: `queue` for normal data and `preempt` for
// realtime data (pause, resume, reset). A single worker thread owns the USB
// driver, moves queued bytes into its own buffers, frames them into packets
// and confirms every packet against the board status before advancing.
//
// States:
//   Unknown -> Initialize -> Active <-> Idle
//   Active/Idle -> Pause/Busy -> Active
//   Wait is entered while waiting for the board to finish
//   Terminate -> End

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::distance::{PAUSE, RESET, RESUME};
use super::interpreter::StatusReport;
use super::ops::{ByteSink, DriverEvent};
use super::packet::{Frame, Immediate, PostSend, assemble, build_packet};
use super::usb::{
    Result, STATUS_BIT_PROCESSING, STATUS_ERROR, STATUS_FINISH, STATUS_NONE, STATUS_OK,
    TransportError, UsbDriver, status_name,
};
use crate::config::{ControllerConfig, IDLE_BACKOFF_MAX_COUNT, WAIT_DRAIN_TIMEOUT};

/// Capacity of the event channel; slow subscribers lose the oldest events
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

const QUEUE_POLL_DELAY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Unknown,
    Initialize,
    Active,
    Idle,
    Pause,
    Busy,
    Wait,
    Terminate,
    End,
}

impl ControllerState {
    pub fn name(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Initialize => "Initializing",
            Self::Active => "Active",
            Self::Idle => "Idle",
            Self::Pause => "Paused",
            Self::Busy => "Busy",
            Self::Wait => "Waiting",
            Self::Terminate => "Terminating",
            Self::End => "Ended",
        }
    }

    pub fn is_paused(self) -> bool {
        matches!(self, Self::Pause | Self::Busy)
    }

    pub fn is_finished(self) -> bool {
        matches!(self, Self::Terminate | Self::End)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observable controller activity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ControllerEvent {
    StateChanged {
        from: ControllerState,
        to: ControllerState,
    },
    Connecting {
        index: usize,
    },
    Connected {
        index: usize,
        chip_version: Option<u32>,
    },
    Disconnected {
        index: usize,
    },
    OpenRefused {
        attempt: u32,
    },
    Failing {
        attempts: u32,
    },
    NoDevice,
    ConnectionError {
        message: String,
    },
    DeviceStatus {
        code: u8,
    },
    WaitingForAccept,
    PacketSent {
        payload: String,
    },
    PacketRejected,
    ConfirmationTimeout {
        polls: u32,
    },
    WaitCancelled,
    WaitingForFinish,
    WaitFinished,
    WaitAborted,
    Paused,
    Resumed,
    Aborted,
    ShutdownRequested,
    QueueEmpty,
    Beep,
    Console {
        command: String,
    },
    Wait {
        millis: u64,
    },
    Status(StatusReport),
    WorkerStarted,
    WorkerStopped,
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged { from, to } => write!(f, "State {} -> {}", from, to),
            Self::Connecting { index } => write!(f, "Connecting to device {}", index),
            Self::Connected {
                index,
                chip_version: Some(v),
            } => write!(f, "Connected to device {} (chip version {})", index, v),
            Self::Connected { index, .. } => write!(f, "Connected to device {}", index),
            Self::Disconnected { index } => write!(f, "Disconnected from device {}", index),
            Self::OpenRefused { attempt } => write!(f, "Connection refused (attempt {})", attempt),
            Self::Failing { attempts } => {
                write!(f, "Connection failing after {} attempts", attempts)
            }
            Self::NoDevice => f.write_str("No device driver"),
            Self::ConnectionError { message } => write!(f, "Connection error: {}", message),
            Self::DeviceStatus { code } => write!(f, "Status {} ({})", status_name(*code), code),
            Self::WaitingForAccept => f.write_str("Waiting for board to accept packets"),
            Self::PacketSent { payload } => write!(f, "Sent {}", payload),
            Self::PacketRejected => f.write_str("Packet rejected"),
            Self::ConfirmationTimeout { polls } => {
                write!(f, "No confirmation after {} polls", polls)
            }
            Self::WaitCancelled => f.write_str("Wait cancelled by finish"),
            Self::WaitingForFinish => f.write_str("Waiting for finish"),
            Self::WaitFinished => f.write_str("Finished"),
            Self::WaitAborted => f.write_str("Wait aborted"),
            Self::Paused => f.write_str("Paused"),
            Self::Resumed => f.write_str("Resumed"),
            Self::Aborted => f.write_str("Aborted"),
            Self::ShutdownRequested => f.write_str("Shutdown requested"),
            Self::QueueEmpty => f.write_str("Queue empty"),
            Self::Beep => f.write_str("Beep"),
            Self::Console { command } => write!(f, "Console: {}", command),
            Self::Wait { millis } => write!(f, "Wait {}ms", millis),
            Self::Status(report) => write!(
                f,
                "Position ({}, {}) {:?} laser {}",
                report.x,
                report.y,
                report.mode,
                if report.laser_on { "on" } else { "off" }
            ),
            Self::WorkerStarted => f.write_str("Worker started"),
            Self::WorkerStopped => f.write_str("Worker stopped"),
        }
    }
}

/// Transport counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerStats {
    pub packets_sent: u64,
    pub packets_rejected: u64,
    pub connection_errors: u64,
    pub open_refusals: u64,
    pub confirmation_timeouts: u64,
}

/// State shared between the handle and the worker
struct Shared {
    config: ControllerConfig,
    queue: Mutex<Vec<u8>>,
    preempt: Mutex<Vec<u8>>,
    state: Mutex<ControllerState>,
    stats: Mutex<ControllerStats>,
    /// Bytes the worker holds but has not had confirmed
    buffered: AtomicUsize,
    abort_waiting: AtomicBool,
    abort_requested: AtomicBool,
    shutdown: AtomicBool,
    events: broadcast::Sender<ControllerEvent>,
    driver: Mutex<Option<Box<dyn UsbDriver>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> ControllerState {
        *self.state.lock()
    }

    fn set_state(&self, to: ControllerState) {
        let from = {
            let mut state = self.state.lock();
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            debug!("Controller state {} -> {}", from, to);
            self.emit(ControllerEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: ControllerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_drained(&self) -> bool {
        let queue = self.queue.lock();
        let preempt = self.preempt.lock();
        queue.is_empty() && preempt.is_empty() && self.buffered.load(Ordering::SeqCst) == 0
    }
}

/// Handle to a controller and its worker thread. Clones share the controller.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Controller {
    /// Create a controller. `driver` may be `None` in mock mode.
    pub fn new(config: ControllerConfig, driver: Option<Box<dyn UsbDriver>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                queue: Mutex::new(Vec::new()),
                preempt: Mutex::new(Vec::new()),
                state: Mutex::new(ControllerState::Unknown),
                stats: Mutex::new(ControllerStats::default()),
                buffered: AtomicUsize::new(0),
                abort_waiting: AtomicBool::new(false),
                abort_requested: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                events,
                driver: Mutex::new(driver),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    /// Spawn the worker thread. Does nothing if it is already running.
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.shared.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let driver = self.shared.driver.lock().take();
        let transport = Transport::new(self.shared.clone(), driver);
        self.shared.set_state(ControllerState::Initialize);
        let handle = thread::Builder::new()
            .name("lhystudios-controller".into())
            .spawn(move || transport.run())?;
        *worker = Some(handle);
        Ok(())
    }

    pub fn state(&self) -> ControllerState {
        self.shared.state()
    }

    pub fn stats(&self) -> ControllerStats {
        *self.shared.stats.lock()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.shared.events.subscribe()
    }

    /// Append to the normal queue
    pub fn write(&self, bytes: &[u8]) {
        self.shared.queue.lock().extend_from_slice(bytes);
    }

    /// Append to the realtime queue, serviced ahead of normal data and while paused
    pub fn realtime_write(&self, bytes: &[u8]) {
        self.shared.preempt.lock().extend_from_slice(bytes);
    }

    pub fn pause(&self) {
        info!("Pausing controller");
        self.realtime_write(PAUSE);
        self.shared.set_state(ControllerState::Pause);
        self.shared.emit(ControllerEvent::Paused);
    }

    pub fn resume(&self) {
        info!("Resuming controller");
        self.realtime_write(RESUME);
        self.shared.set_state(ControllerState::Active);
        self.shared.emit(ControllerEvent::Resumed);
    }

    /// Drop all queued normal data and reset the board. Realtime data is kept.
    pub fn abort(&self) {
        info!("Aborting queued data");
        self.shared.queue.lock().clear();
        self.shared.abort_requested.store(true, Ordering::SeqCst);
        self.realtime_write(RESET);
        self.shared.set_state(ControllerState::Active);
        self.shared.emit(ControllerEvent::Aborted);
    }

    /// Break out of any loop waiting on the board
    pub fn abort_waiting(&self) {
        self.shared.abort_waiting.store(true, Ordering::SeqCst);
    }

    pub fn shutdown(&self) {
        info!("Shutting down controller");
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.abort_waiting.store(true, Ordering::SeqCst);
        if !self.state().is_finished() {
            self.shared.set_state(ControllerState::Terminate);
        }
        self.shared.emit(ControllerEvent::ShutdownRequested);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// Wait for the worker thread to exit
    pub fn join(&self) {
        let handle = self.shared.worker.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Controller worker panicked");
            }
        }
    }

    /// Block until every queued byte has been sent and confirmed.
    ///
    /// Returns false on timeout, or if the controller stopped first.
    pub fn wait_queue_empty(&self, timeout: Option<Duration>) -> bool {
        if self.shared.worker.lock().is_none() {
            return self.shared.is_drained();
        }
        let started = Instant::now();
        loop {
            if self.shared.is_drained() {
                return true;
            }
            if self.state().is_finished() {
                return false;
            }
            if timeout.is_some_and(|t| started.elapsed() >= t) {
                return false;
            }
            thread::sleep(QUEUE_POLL_DELAY);
        }
    }
}

impl ByteSink for Controller {
    fn write(&mut self, bytes: &[u8]) {
        Controller::write(self, bytes);
    }

    fn realtime_write(&mut self, bytes: &[u8]) {
        Controller::realtime_write(self, bytes);
    }

    fn notify(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Wait(duration) => {
                if !self.wait_queue_empty(Some(WAIT_DRAIN_TIMEOUT)) {
                    warn!(
                        "Queue not drained after {:?}, waiting anyway",
                        WAIT_DRAIN_TIMEOUT
                    );
                }
                self.shared.emit(ControllerEvent::Wait {
                    millis: duration.as_millis() as u64,
                });
                thread::sleep(duration);
            }
            DriverEvent::Beep => {
                info!("Beep");
                self.shared.emit(ControllerEvent::Beep);
            }
            DriverEvent::Console(command) => {
                info!("Console command: {}", command);
                self.shared.emit(ControllerEvent::Console { command });
            }
            DriverEvent::Status(report) => self.shared.emit(ControllerEvent::Status(report)),
        }
    }
}

/// Worker side: owns the driver and the send buffers
struct Transport {
    shared: Arc<Shared>,
    driver: Option<Box<dyn UsbDriver>>,
    index: usize,
    connected: bool,
    pre_ok: bool,
    buffer: Vec<u8>,
    realtime_buffer: Vec<u8>,
    last_status: Option<u8>,
    refused_count: u32,
    idle_count: u32,
}

impl Transport {
    fn new(shared: Arc<Shared>, driver: Option<Box<dyn UsbDriver>>) -> Self {
        let index = shared.config.usb_index;
        Self {
            shared,
            driver,
            index,
            connected: false,
            pre_ok: false,
            buffer: Vec::new(),
            realtime_buffer: Vec::new(),
            last_status: None,
            refused_count: 0,
            idle_count: 0,
        }
    }

    fn config(&self) -> &ControllerConfig {
        &self.shared.config
    }

    fn run(mut self) {
        info!("Controller worker started");
        self.shared.emit(ControllerEvent::WorkerStarted);
        loop {
            let state = self.shared.state();
            if state.is_finished() || self.shared.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if state == ControllerState::Initialize || state == ControllerState::Unknown {
                self.shared.set_state(ControllerState::Active);
                continue;
            }
            if self.shared.abort_requested.swap(false, Ordering::SeqCst) {
                self.abort_buffers();
            }
            if state.is_paused()
                && self.realtime_buffer.is_empty()
                && self.shared.preempt.lock().is_empty()
            {
                thread::sleep(self.config().pause_poll_delay);
                continue;
            }

            match self.process_queue() {
                Ok(true) => {}
                Ok(false) => self.idle(),
                Err(TransportError::OpenFailure { index }) => self.on_open_refused(index),
                Err(TransportError::PacketRejected) => {
                    // Same slice is resent on the next pass
                }
                Err(e) => self.on_connection_error(e),
            }
        }
        self.close();
        self.shared.set_state(ControllerState::End);
        self.shared.emit(ControllerEvent::WorkerStopped);
        info!("Controller worker stopped");
    }

    fn idle(&mut self) {
        let state = self.shared.state();
        if !state.is_paused() && !state.is_finished() {
            if state != ControllerState::Idle && self.shared.is_drained() {
                self.shared.emit(ControllerEvent::QueueEmpty);
            }
            self.shared.set_state(ControllerState::Idle);
        }
        thread::sleep(self.idle_delay());
        self.idle_count += 1;
    }

    /// Backoff grows with each idle pass, up to `IDLE_BACKOFF_MAX_COUNT` steps
    fn idle_delay(&self) -> Duration {
        self.config().idle_backoff_step * self.idle_count.min(IDLE_BACKOFF_MAX_COUNT)
    }

    fn on_open_refused(&mut self, index: usize) {
        self.refused_count += 1;
        self.shared.stats.lock().open_refusals += 1;
        warn!(
            "Device {} refused connection (attempt {})",
            index, self.refused_count
        );
        self.shared.emit(ControllerEvent::OpenRefused {
            attempt: self.refused_count,
        });
        if self.refused_count == self.config().max_open_attempts {
            error!(
                "Connection failing after {} attempts, still retrying",
                self.refused_count
            );
            self.shared.emit(ControllerEvent::Failing {
                attempts: self.refused_count,
            });
        }
        thread::sleep(self.config().open_retry_delay);
    }

    fn on_connection_error(&mut self, e: TransportError) {
        error!("Connection error: {}", e);
        {
            let mut stats = self.shared.stats.lock();
            stats.connection_errors += 1;
            if matches!(e, TransportError::ConfirmationTimeout { .. }) {
                stats.confirmation_timeouts += 1;
            }
        }
        match e {
            TransportError::NoDevice => self.shared.emit(ControllerEvent::NoDevice),
            TransportError::ConfirmationTimeout { polls } => {
                self.shared.emit(ControllerEvent::ConfirmationTimeout { polls })
            }
            other => self.shared.emit(ControllerEvent::ConnectionError {
                message: other.to_string(),
            }),
        }
        thread::sleep(self.config().connection_error_delay);
        self.close();
    }

    /// Move producer data into the worker buffers.
    ///
    /// Normal data stays queued while paused so the send buffer is untouched.
    fn promote(&mut self, paused: bool) {
        {
            let mut preempt = self.shared.preempt.lock();
            self.realtime_buffer.append(&mut preempt);
            self.update_buffered();
        }
        if !paused {
            let mut queue = self.shared.queue.lock();
            self.buffer.append(&mut queue);
            self.update_buffered();
        }
    }

    fn update_buffered(&self) {
        self.shared.buffered.store(
            self.buffer.len() + self.realtime_buffer.len(),
            Ordering::SeqCst,
        );
    }

    /// Send at most one packet. Returns whether one was handled.
    fn process_queue(&mut self) -> Result<bool> {
        self.promote(self.shared.state().is_paused());

        let realtime = !self.realtime_buffer.is_empty();
        let source = if realtime {
            &self.realtime_buffer
        } else {
            &self.buffer
        };
        let Some(frame) = assemble(source) else {
            return Ok(false);
        };
        if !realtime && self.shared.state().is_paused() {
            return Ok(false);
        }

        match frame.immediate {
            Some(Immediate::Resume) => self.resume_busy(),
            Some(Immediate::Pause) => self.pause_busy(),
            Some(Immediate::Shutdown) => {
                info!("Shutdown byte received");
                self.shared.shutdown.store(true, Ordering::SeqCst);
                self.shared.set_state(ControllerState::Terminate);
            }
            None => {}
        }

        let mut post_send = frame.post_send;
        if !frame.is_empty() {
            let finished = self.send_frame(&frame)?;
            if finished && post_send == Some(PostSend::WaitFinished) {
                debug!("Board already finished, skipping wait");
                self.shared.emit(ControllerEvent::WaitCancelled);
                post_send = None;
            }
        }

        let source = if realtime {
            &mut self.realtime_buffer
        } else {
            &mut self.buffer
        };
        source.drain(..frame.consumed);
        self.update_buffered();

        match post_send {
            Some(PostSend::WaitFinished) => self.wait_finished()?,
            Some(PostSend::Abort) => self.abort_buffers(),
            None => {}
        }
        self.idle_count = 0;
        if self.shared.state() == ControllerState::Idle {
            self.shared.set_state(ControllerState::Active);
        }
        Ok(true)
    }

    /// Send one framed packet and wait for the board to confirm it.
    /// Returns whether the board reported FINISH while confirming.
    fn send_frame(&mut self, frame: &Frame) -> Result<bool> {
        let Some(payload) = frame.full_payload() else {
            return Err(TransportError::TransportFailure(format!(
                "payload of {} bytes",
                frame.payload.len()
            )));
        };
        let packet = build_packet(payload);
        let text = String::from_utf8_lossy(payload).into_owned();

        let finished = if self.config().mock {
            false
        } else {
            self.open()?;
            if !self.pre_ok {
                self.wait_until_accepting()?;
            }
            let index = self.index;
            self.driver_mut()?.write(index, &packet)?;
            self.confirm()?
        };

        debug!("Sent packet {:?}", text);
        self.shared.stats.lock().packets_sent += 1;
        self.shared
            .emit(ControllerEvent::PacketSent { payload: text });
        Ok(finished)
    }

    /// Poll until the board confirms the last write
    fn confirm(&mut self) -> Result<bool> {
        let limit = self.config().confirmation_poll_limit;
        let mut transient = false;
        let mut finished = false;
        for _ in 0..limit {
            match self.poll_status()? {
                STATUS_NONE => transient = true,
                STATUS_OK => {
                    self.pre_ok = true;
                    return Ok(finished);
                }
                STATUS_ERROR if !transient => {
                    warn!("Packet rejected by board");
                    self.shared.stats.lock().packets_rejected += 1;
                    self.shared.emit(ControllerEvent::PacketRejected);
                    return Err(TransportError::PacketRejected);
                }
                STATUS_ERROR => {
                    // The error may belong to a status read that failed; assume it landed
                    debug!("ERROR after a failed status read, accepting packet");
                    self.pre_ok = true;
                    return Ok(finished);
                }
                STATUS_FINISH => finished = true,
                _ => {}
            }
        }
        Err(TransportError::ConfirmationTimeout { polls: limit })
    }

    /// Poll a freshly opened board until it takes packets
    fn wait_until_accepting(&mut self) -> Result<()> {
        self.shared.emit(ControllerEvent::WaitingForAccept);
        loop {
            if self.shared.state().is_finished() {
                return Ok(());
            }
            if self.shared.abort_waiting.swap(false, Ordering::SeqCst) {
                self.shared.emit(ControllerEvent::WaitAborted);
                return Ok(());
            }
            match self.poll_status()? {
                STATUS_OK | STATUS_ERROR => {
                    self.pre_ok = true;
                    return Ok(());
                }
                _ => thread::sleep(self.config().wait_poll_delay),
            }
        }
    }

    /// Wait until the board has worked through its buffer
    fn wait_finished(&mut self) -> Result<()> {
        let original = self.shared.state();
        if original != ControllerState::Pause {
            self.shared.set_state(ControllerState::Pause);
        }
        info!("Waiting for board to finish");
        self.shared.emit(ControllerEvent::WaitingForFinish);

        let result = self.wait_finished_loop();
        if !self.shared.state().is_finished() {
            self.shared.set_state(original);
        }
        result
    }

    fn wait_finished_loop(&mut self) -> Result<()> {
        loop {
            let state = self.shared.state();
            if state.is_finished() {
                return Ok(());
            }
            if state != ControllerState::Wait {
                self.shared.set_state(ControllerState::Wait);
            }
            if self.shared.abort_waiting.swap(false, Ordering::SeqCst) {
                info!("Wait aborted");
                self.shared.emit(ControllerEvent::WaitAborted);
                return Ok(());
            }
            let status = self.poll_status()?;
            if status == STATUS_NONE {
                warn!("Lost status while waiting, reconnecting");
                self.close();
                self.open()?;
                continue;
            }
            if status & STATUS_BIT_PROCESSING == 0 {
                self.shared.emit(ControllerEvent::WaitFinished);
                return Ok(());
            }
            thread::sleep(self.config().wait_poll_delay);
        }
    }

    fn poll_status(&mut self) -> Result<u8> {
        let code = if self.config().mock {
            if self.shared.state() == ControllerState::Wait {
                STATUS_FINISH
            } else {
                STATUS_OK
            }
        } else {
            let index = self.index;
            self.driver_mut()?.get_status(index)?[1]
        };
        if self.last_status != Some(code) {
            self.last_status = Some(code);
            self.shared.emit(ControllerEvent::DeviceStatus { code });
        }
        Ok(code)
    }

    fn driver_mut(&mut self) -> Result<&mut Box<dyn UsbDriver>> {
        self.driver.as_mut().ok_or(TransportError::NoDevice)
    }

    fn open(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let index = self.index;
        self.shared.emit(ControllerEvent::Connecting { index });
        let driver = self.driver_mut()?;
        let opened = driver.open(index)?;
        let chip_version = driver.get_chip_version(opened).ok();
        self.index = opened;
        self.connected = true;
        self.pre_ok = false;
        self.refused_count = 0;
        info!("Connected to device {} (chip {:?})", opened, chip_version);
        self.shared.emit(ControllerEvent::Connected {
            index: opened,
            chip_version,
        });
        Ok(())
    }

    fn close(&mut self) {
        if !self.connected {
            return;
        }
        let index = self.index;
        if let Some(driver) = self.driver.as_mut() {
            driver.close(index);
        }
        self.connected = false;
        self.pre_ok = false;
        self.last_status = None;
        info!("Disconnected from device {}", index);
        self.shared.emit(ControllerEvent::Disconnected { index });
    }

    fn pause_busy(&self) {
        if self.shared.state() != ControllerState::Pause {
            self.shared.set_state(ControllerState::Busy);
        }
    }

    fn resume_busy(&self) {
        self.shared.set_state(ControllerState::Active);
    }

    /// Drop unsent normal data; realtime data is left alone
    fn abort_buffers(&mut self) {
        self.shared.queue.lock().clear();
        self.buffer.clear();
        self.update_buffered();
        self.shared.set_state(ControllerState::Active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lhystudios::interpreter::{InterpreterContext, apply};
    use crate::lhystudios::ops::MotionOp;
    use crate::lhystudios::usb::{STATUS_BUSY, SimulatedBoard};

    fn test_config() -> ControllerConfig {
        ControllerConfig::default().without_delays()
    }

    fn transport(board: &SimulatedBoard) -> Transport {
        let controller = Controller::new(test_config(), Some(Box::new(board.clone())));
        controller.shared.set_state(ControllerState::Active);
        Transport::new(controller.shared.clone(), Some(Box::new(board.clone())))
    }

    fn padded(body: &str) -> Vec<u8> {
        let mut v = body.as_bytes().to_vec();
        v.resize(30, b'F');
        v
    }

    fn drain_events(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_paused_states_refuse_normal_data() {
        for state in [ControllerState::Pause, ControllerState::Busy] {
            let board = SimulatedBoard::new();
            let mut t = transport(&board);
            t.buffer = b"IBa052\n".to_vec();
            t.shared.set_state(state);

            assert_eq!(t.process_queue(), Ok(false));
            assert_eq!(t.buffer, b"IBa052\n");
            assert!(t.realtime_buffer.is_empty());
            assert!(board.payloads().is_empty());
            assert_eq!(t.shared.state(), state);
        }
    }

    #[test]
    fn test_paused_leaves_queue_unpromoted() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.shared.set_state(ControllerState::Pause);
        t.shared.queue.lock().extend_from_slice(b"IPP\n");

        assert_eq!(t.process_queue(), Ok(false));
        assert!(t.buffer.is_empty());
        assert_eq!(*t.shared.queue.lock(), b"IPP\n");
    }

    #[test]
    fn test_sends_padded_packet() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.shared.queue.lock().extend_from_slice(b"IBa052\n");

        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(board.payloads(), vec![padded("IBa052")]);
        assert!(t.buffer.is_empty());
        assert_eq!(t.shared.stats.lock().packets_sent, 1);
        assert_eq!(t.shared.buffered.load(Ordering::SeqCst), 0);
        assert_eq!(t.process_queue(), Ok(false));
    }

    #[test]
    fn test_partial_packet_is_held() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IBa0".to_vec();
        assert_eq!(t.process_queue(), Ok(false));
        assert_eq!(t.buffer, b"IBa0");
    }

    #[test]
    fn test_rejected_packet_is_resent() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        board.reject_writes(1);
        t.buffer = b"IBa052\n".to_vec();

        assert_eq!(t.process_queue(), Err(TransportError::PacketRejected));
        assert_eq!(t.buffer, b"IBa052\n");
        assert_eq!(t.shared.stats.lock().packets_rejected, 1);

        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(board.payloads(), vec![padded("IBa052")]);
        assert!(t.buffer.is_empty());
    }

    #[test]
    fn test_error_after_failed_read_is_accepted() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IPP\nIBa052\n".to_vec();
        assert_eq!(t.process_queue(), Ok(true));

        board.reject_writes(1);
        board.script_status([STATUS_NONE]);
        assert_eq!(t.process_queue(), Ok(true));
        assert!(t.buffer.is_empty());
        assert_eq!(t.shared.stats.lock().packets_rejected, 0);
    }

    #[test]
    fn test_confirmation_timeout() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IPP\nIBa052\n".to_vec();
        assert_eq!(t.process_queue(), Ok(true));

        board.set_fixed_status(Some(STATUS_NONE));
        assert_eq!(
            t.process_queue(),
            Err(TransportError::ConfirmationTimeout { polls: 300 })
        );
        assert_eq!(t.buffer, b"IBa052\n");
    }

    #[test]
    fn test_wait_finished_after_packet() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        let mut rx = t.shared.events.subscribe();
        t.buffer = b"FNSE-\nIPP\n".to_vec();

        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(board.payloads(), vec![padded("FNSE")]);
        assert_eq!(t.shared.state(), ControllerState::Active);
        assert_eq!(t.buffer, b"IPP\n");

        let events = drain_events(&mut rx);
        assert!(events.contains(&ControllerEvent::WaitingForFinish));
        assert!(events.contains(&ControllerEvent::WaitFinished));
        assert!(events.contains(&ControllerEvent::StateChanged {
            from: ControllerState::Pause,
            to: ControllerState::Wait,
        }));
    }

    #[test]
    fn test_finish_during_confirm_skips_wait() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IPP\nFNSE-\n".to_vec();
        assert_eq!(t.process_queue(), Ok(true));

        let mut rx = t.shared.events.subscribe();
        board.script_status([STATUS_FINISH, STATUS_OK]);
        assert_eq!(t.process_queue(), Ok(true));
        let events = drain_events(&mut rx);
        assert!(events.contains(&ControllerEvent::WaitCancelled));
        assert!(!events.contains(&ControllerEvent::WaitingForFinish));
    }

    #[test]
    fn test_realtime_pause_and_resume() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IBa052\n".to_vec();
        t.shared.preempt.lock().extend_from_slice(b"PN!\n");

        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(t.shared.state(), ControllerState::Busy);
        assert_eq!(t.process_queue(), Ok(false));
        assert_eq!(t.buffer, b"IBa052\n");

        t.shared.preempt.lock().extend_from_slice(b"PN&\n");
        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(t.shared.state(), ControllerState::Active);
        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(
            board.payloads(),
            vec![padded("PN"), padded("PN"), padded("IBa052")]
        );
    }

    #[test]
    fn test_pause_state_survives_busy_byte() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.shared.set_state(ControllerState::Pause);
        t.realtime_buffer = b"PN!\n".to_vec();
        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(t.shared.state(), ControllerState::Pause);
    }

    #[test]
    fn test_reset_aborts_buffer() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.buffer = b"IBa052\nIBa052\n".to_vec();
        t.realtime_buffer = b"I*\n".to_vec();

        assert_eq!(t.process_queue(), Ok(true));
        assert!(t.buffer.is_empty());
        assert!(t.realtime_buffer.is_empty());
        assert_eq!(board.payloads(), vec![padded("I")]);
        assert_eq!(t.shared.state(), ControllerState::Active);
    }

    #[test]
    fn test_mock_mode_needs_no_driver() {
        let controller = Controller::new(
            ControllerConfig {
                mock: true,
                ..test_config()
            },
            None,
        );
        let mut t = Transport::new(controller.shared.clone(), None);
        t.shared.set_state(ControllerState::Active);
        t.buffer = b"IBa052\nFNSE-\n".to_vec();

        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(t.process_queue(), Ok(true));
        assert!(t.buffer.is_empty());
        assert_eq!(controller.stats().packets_sent, 2);
        assert_eq!(controller.state(), ControllerState::Active);
    }

    #[test]
    fn test_missing_driver_is_an_error() {
        let controller = Controller::new(test_config(), None);
        let mut t = Transport::new(controller.shared.clone(), None);
        t.shared.set_state(ControllerState::Active);
        t.buffer = b"IPP\n".to_vec();
        assert_eq!(t.process_queue(), Err(TransportError::NoDevice));
        assert_eq!(t.buffer, b"IPP\n");
    }

    #[test]
    fn test_worker_streams_job() {
        let board = SimulatedBoard::new();
        let mut controller = Controller::new(test_config(), Some(Box::new(board.clone())));
        let mut ctx = InterpreterContext::new(controller.config().board);
        let job = vec![
            MotionOp::RapidMove { x: 0, y: 0 },
            MotionOp::SetSpeed { speed: 50.0 },
            MotionOp::LaserOn,
            MotionOp::Cut { x: 100, y: 100 },
            MotionOp::LaserOff,
            MotionOp::Home,
        ];
        for op in job {
            apply(op, &mut ctx, &mut controller).expect("job encodes");
        }

        controller.start().expect("worker starts");
        assert!(controller.wait_queue_empty(Some(Duration::from_secs(5))));
        controller.shutdown();
        controller.join();

        assert_eq!(
            board.payloads(),
            vec![
                padded("IDS1P"),
                b"ICV2112432051000031NBRS1EM100U".to_vec(),
                padded("FNSE"),
                padded("IPP"),
            ]
        );
        assert_eq!(controller.state(), ControllerState::End);
        assert_eq!(controller.stats().packets_sent, 4);
        assert!(!board.is_open());
    }

    fn abort_waiting_soon(t: &Transport) -> thread::JoinHandle<()> {
        let controller = Controller {
            shared: t.shared.clone(),
        };
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            controller.abort_waiting();
        })
    }

    #[test]
    fn test_abort_waiting_ends_wait_finished() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        let mut rx = t.shared.events.subscribe();
        t.open().expect("open");
        board.set_fixed_status(Some(STATUS_BUSY));

        let aborter = abort_waiting_soon(&t);
        assert_eq!(t.wait_finished(), Ok(()));
        aborter.join().expect("aborter");

        assert_eq!(t.shared.state(), ControllerState::Active);
        assert!(!t.shared.abort_waiting.load(Ordering::SeqCst));
        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ControllerEvent::WaitAborted)));
        assert!(!events.iter().any(|e| matches!(e, ControllerEvent::WaitFinished)));
    }

    #[test]
    fn test_abort_waiting_ends_wait_until_accepting() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        let mut rx = t.shared.events.subscribe();
        t.open().expect("open");
        board.set_fixed_status(Some(STATUS_BUSY));

        let aborter = abort_waiting_soon(&t);
        assert_eq!(t.wait_until_accepting(), Ok(()));
        aborter.join().expect("aborter");

        assert!(!t.pre_ok);
        assert_eq!(t.shared.state(), ControllerState::Active);
        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| matches!(e, ControllerEvent::WaitAborted)));
    }

    #[test]
    fn test_idle_reports_queue_empty_once() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        let mut rx = t.shared.events.subscribe();

        assert_eq!(t.process_queue(), Ok(false));
        t.idle();
        t.idle();
        t.idle();
        assert_eq!(t.shared.state(), ControllerState::Idle);
        assert_eq!(t.idle_count, 3);
        let empties = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, ControllerEvent::QueueEmpty))
            .count();
        assert_eq!(empties, 1);

        // A sent packet resets the backoff and wakes the controller
        t.shared.queue.lock().extend_from_slice(b"IPP\n");
        assert_eq!(t.process_queue(), Ok(true));
        assert_eq!(t.idle_count, 0);
        assert_eq!(t.shared.state(), ControllerState::Active);
    }

    #[test]
    fn test_idle_backoff_is_capped() {
        let config = ControllerConfig {
            idle_backoff_step: Duration::from_millis(20),
            ..test_config()
        };
        let controller = Controller::new(config, None);
        let mut t = Transport::new(controller.shared.clone(), None);

        assert_eq!(t.idle_delay(), Duration::ZERO);
        t.idle_count = 3;
        assert_eq!(t.idle_delay(), Duration::from_millis(60));
        t.idle_count = IDLE_BACKOFF_MAX_COUNT;
        assert_eq!(t.idle_delay(), Duration::from_millis(1000));
        t.idle_count = IDLE_BACKOFF_MAX_COUNT + 25;
        assert_eq!(t.idle_delay(), Duration::from_millis(1000));
    }

    #[test]
    fn test_idle_keeps_paused_state() {
        let board = SimulatedBoard::new();
        let mut t = transport(&board);
        t.shared.set_state(ControllerState::Pause);
        t.idle();
        assert_eq!(t.shared.state(), ControllerState::Pause);
        assert_eq!(t.idle_count, 1);
    }

    #[test]
    fn test_wait_after_cut_drains_and_returns() {
        let board = SimulatedBoard::new();
        let controller = Controller::new(test_config(), Some(Box::new(board.clone())));
        controller.start().expect("worker starts");

        let (tx, rx) = std::sync::mpsc::channel();
        let mut sink = controller.clone();
        thread::spawn(move || {
            let mut ctx = InterpreterContext::new(sink.config().board);
            let job = vec![
                MotionOp::SetSpeed { speed: 50.0 },
                MotionOp::Cut { x: 10, y: 0 },
                MotionOp::Wait { seconds: 0.01 },
            ];
            for op in job {
                apply(op, &mut ctx, &mut sink).expect("job encodes");
            }
            let _ = tx.send(ctx.mode);
        });

        let mode = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("wait returns once the line is sent");
        assert_eq!(mode, crate::lhystudios::InterpreterMode::Rapid);
        assert!(controller.wait_queue_empty(Some(Duration::from_secs(5))));
        assert!(!board.payloads().is_empty());
        assert!(controller.stats().packets_sent >= 1);

        controller.shutdown();
        controller.join();
    }

    #[test]
    fn test_worker_reports_failing_and_keeps_retrying() {
        let board = SimulatedBoard::new();
        board.refuse_opens(5);
        let controller = Controller::new(
            ControllerConfig {
                max_open_attempts: 3,
                ..test_config()
            },
            Some(Box::new(board.clone())),
        );
        let mut rx = controller.subscribe();
        controller.write(b"IBa052\n");

        controller.start().expect("worker starts");
        assert!(controller.wait_queue_empty(Some(Duration::from_secs(5))));
        controller.shutdown();
        controller.join();

        assert_eq!(board.payloads(), vec![padded("IBa052")]);
        assert_eq!(controller.stats().open_refusals, 5);
        let events = drain_events(&mut rx);
        let failing: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ControllerEvent::Failing { .. }))
            .collect();
        assert_eq!(failing, vec![&ControllerEvent::Failing { attempts: 3 }]);
    }

    #[test]
    fn test_worker_recovers_from_write_error() {
        let board = SimulatedBoard::new();
        board.fail_writes(1);
        let controller = Controller::new(test_config(), Some(Box::new(board.clone())));
        controller.write(b"IBa052\n");

        controller.start().expect("worker starts");
        assert!(controller.wait_queue_empty(Some(Duration::from_secs(5))));
        controller.shutdown();
        controller.join();

        assert_eq!(board.payloads(), vec![padded("IBa052")]);
        assert_eq!(controller.stats().connection_errors, 1);
        assert_eq!(board.open_attempts(), 2);
    }

    #[test]
    fn test_shutdown_byte_ends_worker() {
        let board = SimulatedBoard::new();
        let controller = Controller::new(test_config(), Some(Box::new(board.clone())));
        controller.start().expect("worker starts");
        controller.realtime_write(b"\x18\n");
        controller.join();

        assert_eq!(controller.state(), ControllerState::End);
        assert!(controller.is_shutdown());
        assert!(board.payloads().is_empty());
    }

    #[test]
    fn test_abort_clears_queue() {
        let controller = Controller::new(test_config(), None);
        controller.write(b"IBa052\n");
        controller.abort();
        assert!(controller.shared.queue.lock().is_empty());
        assert_eq!(*controller.shared.preempt.lock(), RESET);
        assert_eq!(controller.state(), ControllerState::Active);
    }

    #[test]
    fn test_event_display_names() {
        assert_eq!(ControllerState::Pause.to_string(), "Paused");
        assert_eq!(
            ControllerEvent::DeviceStatus { code: STATUS_OK }.to_string(),
            "Status OK (206)"
        );
        assert_eq!(
            ControllerEvent::Failing { attempts: 3 }.to_string(),
            "Connection failing after 3 attempts"
        );
    }
}
