//! # axiom-probe
//!
//! Brings up the configured backends the way the compositor would, logs every
//! output and input device they announce, paces frames on the outputs for a
//! while and tears everything down again. Handy for checking a machine's
//! DRM/libinput setup without starting a full session.

use anyhow::{Context, Result};
use axiom_backend::backend::{count_by_type, parse_backend_list};
use axiom_backend::output::OutputInfo;
use axiom_backend::{
    autocreate, Backend, BackendConfig, CalloopEventLoop, DirectSession, EventLoop, GlobalRegistry,
    InputDevice, InputDeviceType, Output, Session,
};
use calloop::EventLoop as CalloopLoop;
use clap::Parser;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "axiom-probe")]
#[command(about = "Probe the Axiom compositor backends and report discovered devices")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ", built ", env!("BUILD_DATE"), ")"))]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/axiom/backends.toml")]
    config: String,

    /// Comma separated backend list, e.g. "drm,libinput"
    #[arg(short, long)]
    backends: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print a JSON summary on exit
    #[arg(long)]
    json: bool,

    /// Stop after this many milliseconds (runs until Ctrl-C otherwise)
    #[arg(long)]
    duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct InputSummary {
    name: String,
    device_type: InputDeviceType,
    vendor: u32,
    product: u32,
}

#[derive(Debug, Default, Serialize)]
struct ProbeSummary {
    backends: Vec<String>,
    buffer_caps: Vec<String>,
    drm_fd: Option<i32>,
    outputs: Vec<OutputInfo>,
    inputs: Vec<InputSummary>,
    frames: u64,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting axiom-probe");
    info!("📄 Version: {} ({})", env!("CARGO_PKG_VERSION"), env!("GIT_COMMIT"));
    debug!("Built {} for {}", env!("BUILD_DATE"), env!("TARGET_TRIPLE"));

    // Load configuration
    let mut config = match BackendConfig::load(&cli.config) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", cli.config);
            config
        }
        Err(e) => {
            warn!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            BackendConfig::default()
        }
    };

    // Override config with CLI flags
    if let Some(list) = &cli.backends {
        config.backends.enabled = parse_backend_list(list).context("Invalid --backends value")?;
        config.validate()?;
    }
    if cli.debug {
        config.general.debug = true;
    }

    run(&cli, &config)
}

fn run(cli: &Cli, config: &BackendConfig) -> Result<()> {
    let mut event_loop: CalloopLoop<'static, ()> =
        CalloopLoop::try_new().context("Failed to create event loop")?;
    let timers: Rc<dyn EventLoop> = Rc::new(CalloopEventLoop::new(event_loop.handle()));
    let session: Rc<dyn Session> = Rc::new(DirectSession::new(config.libinput.seat.clone()));
    let registry = GlobalRegistry::new();

    let backend = autocreate(config, timers.clone(), Some(session)).context("Failed to create backends")?;

    let summary = Rc::new(RefCell::new(ProbeSummary::default()));
    let seen: Rc<RefCell<Vec<Rc<InputDevice>>>> = Rc::new(RefCell::new(Vec::new()));
    let frames = Rc::new(Cell::new(0u64));
    backend.for_each_backend(|member| summary.borrow_mut().backends.push(member.name()));

    let delay = config.globals.destroy_delay();
    let sink = summary.clone();
    let frame_counter = frames.clone();
    let globals = registry.clone();
    let _outputs = backend.events().new_output.connect(move |output: &Rc<Output>| {
        info!("🖥️ Output {} announced", output.name());
        output.set_global_destroy_delay(delay);
        let name = output.create_global(&globals);
        debug!("{} advertised as global {}", output.name(), name);
        sink.borrow_mut().outputs.push(output.info().clone());

        let counter = frame_counter.clone();
        let weak: Weak<Output> = Rc::downgrade(output);
        // Dropping the handle keeps the listener attached for the output's lifetime
        let _ = output.events.frame.connect(move |_| {
            counter.set(counter.get() + 1);
            if let Some(output) = weak.upgrade() {
                output.schedule_frame();
            }
        });
        output.schedule_frame();
    });

    let sink = seen.clone();
    let _inputs = backend.events().new_input.connect(move |device: &Rc<InputDevice>| {
        info!(
            "🎮 Input {} ({}, {:04x}:{:04x})",
            device.name(),
            device.device_type(),
            device.vendor(),
            device.product()
        );
        sink.borrow_mut().push(device.clone());
    });

    if !backend.start() {
        error!("❌ No backend could be started");
        backend.destroy();
        anyhow::bail!("Failed to start backends");
    }

    let signal = event_loop.get_signal();
    ctrlc::set_handler(move || signal.stop()).context("Failed to install Ctrl-C handler")?;

    if let Some(ms) = cli.duration_ms {
        let signal = event_loop.get_signal();
        timers
            .add_timer(Duration::from_millis(ms), Box::new(move || signal.stop()))
            .context("Failed to arm the duration timer")?;
    }

    info!("✅ Backends running, press Ctrl-C to stop");
    event_loop
        .run(None::<Duration>, &mut (), |_| {})
        .context("Event loop failed")?;

    {
        let mut summary = summary.borrow_mut();
        summary.buffer_caps = backend
            .buffer_caps()
            .iter_names()
            .map(|(name, _)| name.to_string())
            .collect();
        summary.drm_fd = backend.drm_fd();
        summary.frames = frames.get();
        summary.inputs = seen
            .borrow()
            .iter()
            .map(|device| InputSummary {
                name: device.name().to_string(),
                device_type: device.device_type(),
                vendor: device.vendor(),
                product: device.product(),
            })
            .collect();
    }
    for (ty, count) in count_by_type(&seen.borrow()) {
        info!("  {} x {}", count, ty);
    }

    info!("🛑 Shutting down backends");
    backend.destroy();

    // Output globals are freed once their grace period runs out
    let freed = Rc::new(Cell::new(0usize));
    let counter = freed.clone();
    let _freed = registry
        .events()
        .destroyed
        .connect(move |_| counter.set(counter.get() + 1));
    let deadline = Instant::now() + delay + Duration::from_millis(100);
    while !registry.is_empty() && Instant::now() < deadline {
        event_loop
            .dispatch(Some(Duration::from_millis(50)), &mut ())
            .context("Event loop failed")?;
    }
    if !registry.is_empty() {
        warn!("⚠️ {} global(s) not freed before exit", registry.len());
    }

    if cli.json {
        let summary = summary.borrow();
        println!("{}", serde_json::to_string_pretty(&*summary)?);
    }

    info!("👋 {} frame(s) presented, {} global(s) freed", frames.get(), freed.get());
    Ok(())
}
