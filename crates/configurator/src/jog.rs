use std::io::Write as _;

use anyhow::anyhow;
use crossterm::event::{Event, EventStream, KeyCode, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use filigree_rig::{clamp_angle, Rig};
use futures::StreamExt;

use crate::{Error, Result};

const STEPS: [f64; 4] = [0.5, 1.0, 5.0, 15.0];

fn show(rig: &Rig, idx: usize, step: f64) -> Result<()> {
    let motor = rig.motor(idx)?;
    // Raw mode: no implicit carriage return.
    eprint!(
        "\r\x1b[Kmotor {idx}: {:.3} (saved {:.3}), step {step}",
        motor.angle(),
        motor.last_saved_angle()
    );
    std::io::stderr().flush()?;
    Ok(())
}

async fn jog_keys(events: &mut EventStream, rig: &mut Rig, idx: usize) -> Result<()> {
    let mut step_idx = 0;
    show(rig, idx, STEPS[step_idx])?;
    while let Some(ev) = events.next().await.transpose()? {
        let Event::Key(ev) = ev else {
            continue;
        };
        if ev.kind != KeyEventKind::Press {
            continue;
        }
        let delta = match ev.code {
            KeyCode::Char('q') => {
                return Err(Error::Exit);
            }
            KeyCode::Enter | KeyCode::Esc => {
                return Ok(());
            }
            KeyCode::Left | KeyCode::Char('h') => Some(-STEPS[step_idx]),
            KeyCode::Right | KeyCode::Char('l') => Some(STEPS[step_idx]),
            KeyCode::Up | KeyCode::Char('k') => {
                step_idx = (step_idx + 1).min(STEPS.len() - 1);
                None
            }
            KeyCode::Down | KeyCode::Char('j') => {
                step_idx = step_idx.saturating_sub(1);
                None
            }
            KeyCode::Char('u') => {
                rig.motor_mut(idx)?.undo().await?;
                None
            }
            KeyCode::Char('r') => {
                rig.record_changes();
                None
            }
            _ => None,
        };
        if let Some(delta) = delta {
            let motor = rig.motor_mut(idx)?;
            let target = clamp_angle(motor.motor_type(), motor.angle() + delta);
            if let Err(e) = motor.move_to(target).await {
                eprint!("\r\x1b[K{e}\r\n");
            }
        }
        show(rig, idx, STEPS[step_idx])?;
    }
    Err(anyhow!("event stream ended").into())
}

/// Moves one motor from the keyboard until <enter>.
pub async fn jog(rig: &mut Rig, idx: usize) -> Result<()> {
    rig.motor(idx)?;
    eprintln!("Jogging motor {idx}: left/right (h/l) to move, up/down (k/j) to change the step,");
    eprintln!("u to undo, r to record, <enter> to finish, q to quit.");
    enable_raw_mode()?;

    let res: Result<()> = async {
        let mut events = EventStream::new();
        jog_keys(&mut events, rig, idx).await
    }
    .await;

    disable_raw_mode()?;
    eprintln!();

    res
}
