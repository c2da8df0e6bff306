use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use clap::Parser;
use ndarray::Axis;

use nisession_backend::sim::SimDriver;
use nisession_backend::{DriverClient, SampleBlock, SessionRegistry};
use niscope_backend::info::SystemInfo;
use niscope_backend::worker_cmd_chan::{CmdChan, WorkerCmd};
use niscope_backend::{Scope, ScopeConfig, ScopeResult};

/// Two-channel oscilloscope on NI-DAQmx analog inputs.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// TOML configuration file; the stock scope is used without one
    #[arg(long)]
    config: Option<PathBuf>,

    /// Acquire from the in-process simulated driver instead of the hardware
    #[arg(long)]
    simulate: bool,

    /// Stop after displaying this many blocks
    #[arg(long)]
    frames: Option<u64>,

    /// Print the driver version, devices, channels and tasks, then exit
    #[arg(long)]
    info: bool,
}

const SIM_TICK: Duration = Duration::from_millis(10);

/// Feeds the simulated driver at the configured sample rate until closed.
struct SimClock {
    cmd_chan: CmdChan,
    handle: Option<JoinHandle<()>>,
}

impl SimClock {
    /// Samples are produced `step` at a time so every-N-samples notifications fire before
    /// the next chunk lands in the input buffer.
    fn spawn(driver: Arc<SimDriver>, rate: f64, step: u64) -> Self {
        let cmd_chan = CmdChan::new();
        let mut recvr = cmd_chan.new_recvr();
        let step = step.max(1);
        let handle = std::thread::spawn(move || {
            let started = Instant::now();
            let mut produced = 0u64;
            while let Ok(None) = recvr.recv_timeout(SIM_TICK) {
                let due = (started.elapsed().as_secs_f64() * rate) as u64;
                while produced + step <= due {
                    driver.advance_all(step);
                    produced += step;
                }
            }
        });
        Self {
            cmd_chan,
            handle: Some(handle),
        }
    }
}

impl Drop for SimClock {
    fn drop(&mut self) {
        self.cmd_chan.send(WorkerCmd::Close);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("simulation clock panicked");
            }
        }
    }
}

fn sine_waveform(rate: f64) -> impl Fn(usize, u64) -> f64 + Send + Sync {
    move |channel, sample| {
        let t = sample as f64 / rate;
        let phase = channel as f64 * std::f64::consts::FRAC_PI_2;
        0.25 + 0.2 * (2.0 * std::f64::consts::PI * 5.0 * t + phase).sin()
    }
}

fn summary(block: &SampleBlock, names: &[String]) -> String {
    let means = block.data().mean_axis(Axis(1));
    (0..block.channels())
        .map(|i| {
            let trace = block.channel(i);
            let min = trace.fold(f64::INFINITY, |a, &b| a.min(b));
            let max = trace.fold(f64::NEG_INFINITY, |a, &b| a.max(b));
            let mean = means.as_ref().map_or(f64::NAN, |m| m[i]);
            let name = names.get(i).map_or("?", String::as_str);
            format!("{}: mean {:.4} [{:.4}, {:.4}]", name, mean, min, max)
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Shows the freshest block once per display period, like a scope screen refresh.
fn display<D: DriverClient + 'static>(
    registry: Arc<SessionRegistry<D>>,
    config: ScopeConfig,
    frames: Option<u64>,
) -> ScopeResult<()> {
    let period = config.display_period();
    let mut scope = Scope::new(registry, config)?;
    let names = scope.channel_names()?;
    scope.start()?;

    let mut shown = 0u64;
    while frames.map_or(true, |n| shown < n) {
        std::thread::sleep(period);
        if let Some(block) = scope.latest()? {
            shown += 1;
            log::info!(
                "block {} {:?}: {}",
                block.sequence(),
                block.shape(),
                summary(&block, &names)
            );
        }
    }
    scope.stop()
}

fn run(args: Args) -> ScopeResult<()> {
    let config = match &args.config {
        Some(path) => ScopeConfig::load(path)?,
        None => ScopeConfig::default(),
    };

    if args.simulate {
        let driver = Arc::new(SimDriver::new().with_waveform(sine_waveform(config.rate)));
        let registry = Arc::new(SessionRegistry::from_arc(Arc::clone(&driver)));
        if args.info {
            println!("{}", SystemInfo::query(&registry)?);
            return Ok(());
        }
        let _clock = SimClock::spawn(driver, config.rate, u64::from(config.threshold));
        return display(registry, config, args.frames);
    }

    #[cfg(feature = "hardware")]
    {
        let registry = Arc::new(SessionRegistry::new(niscope_backend::nidaqmx::NiDriver::new()));
        if args.info {
            println!("{}", SystemInfo::query(&registry)?);
            return Ok(());
        }
        display(registry, config, args.frames)
    }
    #[cfg(not(feature = "hardware"))]
    {
        Err(niscope_backend::ScopeError::Config(
            "built without the `hardware` feature; run with --simulate".to_string(),
        ))
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
