use std::{path::PathBuf, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Context as _};
use clap::Parser;
use filigree_protocol::{Command, CommandId, MotorType};
use filigree_rig::{
    clamp_angle, PortOpener, Rig, RigConfig, SerialOpener, Setting, SimulatedOpener,
};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reedline::{DefaultPrompt, DefaultPromptSegment, Prompt, Reedline};

mod jog;

const TICK: Duration = Duration::from_millis(50);
const SIMULATED_MOTORS: u32 = 4;

const HELP: &str = "\
commands:
  ports                      list serial devices
  status                     show controllers
  connect <c|all>            open a controller's port
  disconnect <c|all>         close it
  motors                     list motors on connected controllers
  move <m> <deg>             move a motor to an angle
  by <m> <deg>               move a motor by an amount
  jog <m>                    move a motor with the arrow keys
  undo <m> | reset <m>       back to the saved angle | back to zero
  type <m> <0-4>             set motor type
  info <m>                   read status and alerts
  get <m> <setting>          velocity, acceleration, cutting-acceleration, resolution
  set <m> <setting> <value>
  record                     append every changed motor to the sequence
  cut <m>                    append a cut for a cutter motor
  delay <c> <ms>             append a pause on a controller
  remove <i>                 delete a step
  list                       show the sequence
  cursor <i>                 select a step
  save <file> | load <file>
  play [i]                   play from the cursor or from step i
  quit";

/// Record and replay moves on a multi-controller stepper rig.
#[derive(Parser)]
struct Args {
    /// JSON rig configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Serial device, once per controller in order.
    #[arg(long)]
    port: Vec<String>,
    #[arg(long)]
    baud: Option<u32>,
    /// Talk to simulated boards instead of serial devices.
    #[arg(long)]
    simulate: bool,
    #[arg(long)]
    step_delay_ms: Option<u64>,
    /// A saved sequence to start with.
    sequence: Option<PathBuf>,
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.parse_filters("filigree=info,filigree_rig=info"),
    };
    builder.init();
}

fn load_config(args: &Args) -> anyhow::Result<RigConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => RigConfig::default(),
    };
    if config.ports.len() < args.port.len() {
        config.ports.resize(args.port.len(), None);
    }
    for (slot, port) in config.ports.iter_mut().zip(&args.port) {
        *slot = Some(port.clone());
    }
    if let Some(baud) = args.baud {
        config.baud_rate = baud;
    }
    if let Some(delay) = args.step_delay_ms {
        config.step_delay_ms = delay;
    }
    if args.simulate {
        // Simulated boards don't need to boot.
        config.settle_delay_ms = 0;
    }
    Ok(config)
}

fn arg<T: FromStr>(args: &[&str], idx: usize, what: &str) -> anyhow::Result<T> {
    let s = args
        .get(idx)
        .ok_or_else(|| anyhow!("missing argument: {what}"))?;
    s.parse()
        .map_err(|_| anyhow!("expected {what}, got {s:?}"))
}

fn parse_setting(s: &str) -> anyhow::Result<Setting> {
    Ok(match s {
        "velocity" => Setting::Velocity,
        "acceleration" => Setting::Acceleration,
        "cutting-acceleration" => Setting::CuttingAcceleration,
        "resolution" => Setting::Resolution,
        _ => return Err(anyhow!("unknown setting {s:?}")),
    })
}

/// The controllers a `connect`/`disconnect` argument refers to.
fn targets(rig: &Rig, args: &[&str]) -> anyhow::Result<Vec<u32>> {
    match args.first() {
        None | Some(&"all") => Ok(rig.controllers().iter().map(|c| c.id()).collect()),
        Some(_) => Ok(vec![arg(args, 0, "a controller id")?]),
    }
}

async fn connect(rig: &mut Rig, ids: &[u32]) -> anyhow::Result<()> {
    let progress = MultiProgress::new();
    let mut failures = 0;
    for &id in ids {
        let bar = progress.add(
            ProgressBar::new_spinner().with_message(format!("Connecting controller {id}...")),
        );
        bar.enable_steady_tick(TICK);
        match rig.connect(id).await {
            Ok(()) => {
                let count = rig.controller(id)?.motor_count();
                bar.finish_with_message(format!("controller {id}: {count} motors"));
            }
            Err(e) => {
                bar.abandon_with_message(format!("controller {id}: {e}"));
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(anyhow!("{failures} controller(s) failed to connect"));
    }
    Ok(())
}

fn describe(cmd: &Command) -> String {
    let what = match cmd.kind() {
        Some(kind) => format!("{kind:?}"),
        None => format!("command {}", cmd.command_id),
    };
    if cmd.kind() == Some(CommandId::MotorDelay) {
        format!("{what} c{} {}ms", cmd.controller_id, cmd.param)
    } else {
        format!("{what} c{} m{} {}", cmd.controller_id, cmd.motor_id, cmd.param)
    }
}

fn print_motors(rig: &Rig) {
    if rig.motors().is_empty() {
        eprintln!("no motors: nothing is connected");
    }
    for m in rig.motors() {
        eprintln!(
            "{:>3}  c{}/m{}  {:<13} {:>9.3} {:>9.3} {}",
            m.display_index(),
            m.controller_id(),
            m.id(),
            format!("{:?}", m.motor_type()),
            m.angle(),
            m.last_saved_angle(),
            if m.has_changed() { "*" } else { "" },
        );
    }
}

fn print_sequence(rig: &Rig) {
    let seq = rig.sequence();
    if seq.is_empty() {
        eprintln!("the sequence is empty");
    }
    for (i, cmd) in seq.commands().iter().enumerate() {
        let marker = if i == seq.cursor() { ">" } else { " " };
        eprintln!("{marker}{i:>3}  {}", describe(cmd));
    }
}

async fn play(rig: &mut Rig, from: Option<usize>) -> anyhow::Result<()> {
    if rig.sequence().is_empty() {
        return Err(anyhow!("nothing to play"));
    }
    let player = rig.player().clone();
    let mut cursor = player.subscribe_cursor();
    let bar = ProgressBar::new(rig.sequence().len() as u64).with_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} {msg}")?,
    );
    eprintln!("playing; ctrl-c pauses after the current step, twice aborts it");

    let playback = rig.play(from);
    tokio::pin!(playback);
    let mut pausing = false;
    let report = loop {
        tokio::select! {
            report = &mut playback => break report,
            Ok(()) = cursor.changed() => {
                bar.set_position(*cursor.borrow_and_update() as u64);
            }
            _ = tokio::signal::ctrl_c() => {
                if pausing {
                    player.abort();
                } else {
                    bar.set_message("pausing...");
                    player.pause();
                    pausing = true;
                }
            }
        }
    };
    bar.finish_with_message(if report.completed { "done" } else { "paused" });
    eprintln!(
        "{} steps ok, {} failed, cursor at {}",
        report.executed, report.failed, report.cursor
    );
    Ok(())
}

async fn run_command(rig: &mut Rig, line: &str) -> Result<()> {
    let words: Vec<&str> = line.split_whitespace().collect();
    let Some((&cmd, args)) = words.split_first() else {
        return Ok(());
    };
    // Unplugged boards take their motors with them.
    if rig.sync_motors() {
        eprintln!("the set of connected controllers changed; motors renumbered");
    }

    match cmd {
        "quit" | "exit" => return Err(Error::Exit),
        "help" => eprintln!("{HELP}"),
        "ports" => {
            for port in SerialOpener::available_ports()? {
                eprintln!("{port}");
            }
        }
        "status" => {
            for c in rig.controllers() {
                let port = rig.config().port(c.id()).unwrap_or("-");
                eprintln!(
                    "controller {}  {:<12} {} motors  {port}",
                    c.id(),
                    format!("{:?}", c.state()),
                    c.motor_count()
                );
            }
        }
        "connect" => {
            let ids = targets(rig, args)?;
            connect(rig, &ids).await?;
        }
        "disconnect" => {
            for id in targets(rig, args)? {
                rig.disconnect(id).await?;
            }
        }
        "motors" => print_motors(rig),
        "move" | "by" => {
            let idx: usize = arg(args, 0, "a motor index")?;
            let value: f64 = arg(args, 1, "an angle")?;
            let motor = rig.motor_mut(idx)?;
            let target = if cmd == "by" {
                motor.angle() + value
            } else {
                value
            };
            let target = clamp_angle(motor.motor_type(), target);
            motor.move_to(target).await?;
        }
        "jog" => {
            let idx: usize = arg(args, 0, "a motor index")?;
            jog::jog(rig, idx).await?;
        }
        "undo" => rig.motor_mut(arg(args, 0, "a motor index")?)?.undo().await?,
        "reset" => {
            rig.motor_mut(arg(args, 0, "a motor index")?)?
                .reset()
                .await?;
        }
        "type" => {
            let idx: usize = arg(args, 0, "a motor index")?;
            let ty: u32 = arg(args, 1, "a motor type")?;
            rig.motor_mut(idx)?.set_motor_type(ty).await?;
            if let Some(ty) = MotorType::from_u32(ty) {
                eprintln!("motor {idx} is now {ty:?}");
            }
        }
        "info" => {
            let m = rig.motor(arg(args, 0, "a motor index")?)?;
            let c = rig.controller(m.controller_id())?;
            let status = c.status(m.id()).await?;
            let alerts = c.alerts(m.id()).await?;
            eprintln!("status {status:#x}, alerts {alerts:#x}");
        }
        "get" => {
            let m = rig.motor(arg(args, 0, "a motor index")?)?;
            let setting = parse_setting(args.get(1).copied().unwrap_or_default())?;
            let value = rig.controller(m.controller_id())?.query(setting, m.id()).await?;
            eprintln!("{value}");
        }
        "set" => {
            let m = rig.motor(arg(args, 0, "a motor index")?)?;
            let setting = parse_setting(args.get(1).copied().unwrap_or_default())?;
            let value: u32 = arg(args, 2, "a value")?;
            rig.controller(m.controller_id())?
                .configure(setting, m.id(), value)
                .await?;
        }
        "record" => {
            let n = rig.record_changes();
            eprintln!("recorded {n} moves");
        }
        "cut" => rig.record_cut(arg(args, 0, "a motor index")?)?,
        "delay" => rig.record_delay(arg(args, 0, "a controller id")?, arg(args, 1, "milliseconds")?)?,
        "remove" => {
            let idx: usize = arg(args, 0, "a step index")?;
            if rig.remove(idx).is_none() {
                return Err(anyhow!("no step {idx}").into());
            }
        }
        "list" => print_sequence(rig),
        "cursor" => rig.sequence_mut().set_cursor(arg(args, 0, "a step index")?),
        "save" => {
            let path: PathBuf = arg(args, 0, "a file name")?;
            std::fs::write(&path, rig.sequence_file())
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("saved {} steps to {}", rig.sequence().len(), path.display());
        }
        "load" => {
            let path: PathBuf = arg(args, 0, "a file name")?;
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            rig.load_sequence(&text)?;
            eprintln!("loaded {} steps", rig.sequence().len());
        }
        "play" => {
            let from = match args.first() {
                Some(_) => Some(arg(args, 0, "a step index")?),
                None => None,
            };
            play(rig, from).await?;
        }
        _ => return Err(anyhow!("unknown command {cmd:?}; try `help`").into()),
    }
    Ok(())
}

fn string_prompt(s: &str) -> DefaultPrompt {
    DefaultPrompt::new(
        DefaultPromptSegment::Basic(s.to_owned()),
        DefaultPromptSegment::Empty,
    )
}

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    match reed.read_line(prompt)? {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

async fn command_mode(rig: &mut Rig) -> Result<()> {
    let mut reed = Reedline::create();
    let prompt = string_prompt("filigree");
    loop {
        let line = read_cmd(&mut reed, &prompt)?;
        match run_command(rig, line.trim()).await {
            Ok(()) => {}
            Err(Error::Exit) => return Err(Error::Exit),
            Err(Error::Err(e)) => eprintln!("error: {e:#}"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    let config = load_config(&args)?;
    log::debug!("using {config:?}");

    let opener: Arc<dyn PortOpener> = if args.simulate {
        Arc::new(SimulatedOpener::new(SIMULATED_MOTORS))
    } else {
        Arc::new(SerialOpener::new(&config))
    };
    let mut rig = Rig::new(config, opener);

    if let Some(path) = &args.sequence {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        rig.load_sequence(&text)?;
        eprintln!("loaded {} steps from {}", rig.sequence().len(), path.display());
    }

    let ready: Vec<u32> = rig
        .controllers()
        .iter()
        .map(|c| c.id())
        .filter(|&id| args.simulate || rig.config().port(id).is_some())
        .collect();
    if let Err(e) = connect(&mut rig, &ready).await {
        eprintln!("{e}; use `connect` to retry");
    }

    match command_mode(&mut rig).await {
        Ok(()) | Err(Error::Exit) => {}
        Err(Error::Err(e)) => return Err(e),
    }
    for c in rig.controllers() {
        c.close_port().await;
    }
    eprintln!("exiting...");
    Ok(())
}
