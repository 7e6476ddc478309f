// Keyboard jog: WASD move, R/F step size, H home, P pause/resume, X abort, Q quit
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::info;

use lhystudios_runtime::config::{TOPIC_CMD_CONTROL, TOPIC_CMD_JOB};

const STEPS: [i32; 3] = [10, 100, 1000]; // device units (mils)

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let jobs = session.declare_publisher(TOPIC_CMD_JOB).await?;
    let control = session.declare_publisher(TOPIC_CMD_CONTROL).await?;

    info!("Controls: WASD=jog, R/F=step, H=home, P=pause/resume, X=abort, Q=quit");
    print_step(0);

    enable_raw_mode()?;
    let result = run_jog(&jobs, &control).await;
    disable_raw_mode()?;

    result
}

/// Relative rapid move, leaving the runtime in absolute mode afterwards
fn jog(dx: i32, dy: i32) -> Value {
    json!({
        "ops": [
            {"op": "set_incremental"},
            {"op": "rapid_move", "x": dx, "y": dy},
            {"op": "set_absolute"}
        ]
    })
}

async fn run_jog(
    jobs: &zenoh::pubsub::Publisher<'_>,
    control: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;
    let mut paused = false;

    loop {
        if !event::poll(Duration::from_millis(50))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let step = STEPS[step_idx];
        match code {
            // Jog; +y is toward the bottom of the bed
            KeyCode::Char('w') => jobs.put(jog(0, -step).to_string()).await?,
            KeyCode::Char('s') => jobs.put(jog(0, step).to_string()).await?,
            KeyCode::Char('a') => jobs.put(jog(-step, 0).to_string()).await?,
            KeyCode::Char('d') => jobs.put(jog(step, 0).to_string()).await?,
            KeyCode::Char('h') => {
                let home = json!({"ops": [{"op": "home"}]});
                jobs.put(home.to_string()).await?;
            }

            // Step size
            KeyCode::Char('r') => {
                step_idx = (step_idx + 1).min(STEPS.len() - 1);
                print_step(step_idx);
            }
            KeyCode::Char('f') => {
                step_idx = step_idx.saturating_sub(1);
                print_step(step_idx);
            }

            // Out-of-band control
            KeyCode::Char('p') => {
                paused = !paused;
                let command = if paused { "pause" } else { "resume" };
                control.put(json!({"command": command}).to_string()).await?;
                info!("Sent {}", command);
            }
            KeyCode::Char('x') => {
                control.put(json!({"command": "abort"}).to_string()).await?;
                info!("Sent abort");
            }

            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => {}
        }
    }

    Ok(())
}

fn print_step(idx: usize) {
    info!("Step: {} units", STEPS[idx]);
}
