// Zenoh front end for the controller
//
// Jobs arrive as JSON on TOPIC_CMD_JOB and are encoded on an interpreter
// thread that streams bytes straight into the controller. Control commands
// (pause/resume/abort) bypass the job queue. Controller events are forwarded
// as they happen and a health message goes out every tick.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{
    ControllerConfig, LOOP_HZ, TOPIC_CMD_CONTROL, TOPIC_CMD_JOB, TOPIC_EVENT, TOPIC_HEALTH,
};
use crate::lhystudios::{
    Controller, ControllerState, InterpreterContext, MotionOp, StatusReport, UsbDriver, apply,
};
use crate::messages::{ControlCommand, ControllerHealth, JobCommand};

#[derive(Debug, Default)]
struct JobCounters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

pub struct Runtime {
    controller: Controller,
    jobs: Option<mpsc::Sender<Vec<MotionOp>>>,
    interpreter: Option<JoinHandle<()>>,
    position: Arc<Mutex<StatusReport>>,
    counters: Arc<JobCounters>,
}

impl Runtime {
    /// Start the interpreter thread feeding `controller`
    pub fn new(controller: Controller) -> std::io::Result<Self> {
        let ctx = InterpreterContext::from_config(controller.config());
        let position = Arc::new(Mutex::new(ctx.status()));
        let counters = Arc::new(JobCounters::default());
        let (tx, rx) = mpsc::channel();

        let interpreter = {
            let sink = controller.clone();
            let position = position.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name("lhystudios-interpreter".into())
                .spawn(move || interpret(ctx, sink, rx, position, counters))?
        };

        Ok(Self {
            controller,
            jobs: Some(tx),
            interpreter: Some(interpreter),
            position,
            counters,
        })
    }

    /// Queue a job for the interpreter
    pub fn on_job(&mut self, job: JobCommand) {
        info!("Received job with {} ops", job.ops.len());
        self.counters.received.fetch_add(1, Ordering::SeqCst);
        let sent = self.jobs.as_ref().map(|tx| tx.send(job.ops));
        if !matches!(sent, Some(Ok(()))) {
            warn!("Interpreter is gone, dropping job");
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn on_control(&mut self, cmd: ControlCommand) {
        info!("Received control command: {:?}", cmd);
        match cmd {
            ControlCommand::Pause => self.controller.pause(),
            ControlCommand::Resume => self.controller.resume(),
            ControlCommand::Abort => self.controller.abort(),
            ControlCommand::AbortWaiting => self.controller.abort_waiting(),
            ControlCommand::Shutdown => self.controller.shutdown(),
        }
    }

    pub fn health(&self) -> ControllerHealth {
        ControllerHealth {
            state: self.controller.state(),
            stats: self.controller.stats(),
            position: self.position.lock().clone(),
            jobs_received: self.counters.received.load(Ordering::SeqCst),
            jobs_completed: self.counters.completed.load(Ordering::SeqCst),
            jobs_failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Stop the controller and wait for both threads
    pub fn stop(&mut self) {
        self.controller.shutdown();
        // Closing the channel ends the interpreter loop
        self.jobs = None;
        if let Some(handle) = self.interpreter.take() {
            if handle.join().is_err() {
                error!("Interpreter thread panicked");
            }
        }
        self.controller.join();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.interpreter.is_some() {
            self.stop();
        }
    }
}

fn interpret(
    mut ctx: InterpreterContext,
    mut sink: Controller,
    jobs: mpsc::Receiver<Vec<MotionOp>>,
    position: Arc<Mutex<StatusReport>>,
    counters: Arc<JobCounters>,
) {
    for ops in jobs {
        let mut failed = false;
        for op in ops {
            if sink.is_shutdown() {
                break;
            }
            if let Err(e) = apply(op, &mut ctx, &mut sink) {
                // Planning defect upstream; the rest of this job is unsafe to run
                error!("Job aborted: {}", e);
                failed = true;
                break;
            }
        }
        *position.lock() = ctx.status();
        if failed {
            counters.failed.fetch_add(1, Ordering::SeqCst);
        } else {
            counters.completed.fetch_add(1, Ordering::SeqCst);
        }
    }
    info!("Interpreter stopped");
}

pub async fn run(
    config: ControllerConfig,
    driver: Option<Box<dyn UsbDriver>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let sub_job = session.declare_subscriber(TOPIC_CMD_JOB).await?;
    let sub_control = session.declare_subscriber(TOPIC_CMD_CONTROL).await?;
    let pub_event = session.declare_publisher(TOPIC_EVENT).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let controller = Controller::new(config, driver);
    let mut events = controller.subscribe();
    controller.start()?;
    let mut runtime = Runtime::new(controller.clone())?;
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!(
        "Runtime started: board {}, {}Hz health",
        controller.config().board,
        LOOP_HZ
    );
    info!("Subscribed to: {}, {}", TOPIC_CMD_JOB, TOPIC_CMD_CONTROL);
    info!("Publishing to: {}, {}", TOPIC_EVENT, TOPIC_HEALTH);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
        }

        // 1. Control commands first, they may pause or abort the job queue
        while let Ok(Some(sample)) = sub_control.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ControlCommand>(&payload) {
                Ok(cmd) => runtime.on_control(cmd),
                Err(e) => warn!("Failed to parse control command: {}", e),
            }
        }

        // 2. Jobs, in arrival order
        while let Ok(Some(sample)) = sub_job.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<JobCommand>(&payload) {
                Ok(job) => runtime.on_job(job),
                Err(e) => warn!("Failed to parse job: {}", e),
            }
        }

        // 3. Forward controller events
        loop {
            match events.try_recv() {
                Ok(event) => {
                    debug!("{}", event);
                    pub_event.put(serde_json::to_string(&event)?).await?;
                }
                Err(TryRecvError::Lagged(n)) => warn!("Dropped {} controller events", n),
                Err(_) => break,
            }
        }

        // 4. Publish health
        let health_json = serde_json::to_string(&runtime.health())?;
        pub_health.put(health_json).await?;

        if controller.state() == ControllerState::End {
            info!("Controller ended");
            break;
        }
    }

    runtime.stop();
    Ok(())
}
