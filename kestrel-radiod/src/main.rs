//! kestrel-radiod: multichannel SDR receiver daemon.
//!
//! Wires one front-end driver to the fast-convolution channelizer, spawns
//! the per-channel demodulators named in the config, and serves the
//! TLV status/command plane on the configured multicast group.

mod config;
mod drivers;
mod status_loop;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use kestrel_core::chan::{spawn_reaper, ChannelTable};
use kestrel_core::filter::{FilterInput, FilterParams, SpectrumBus};
use kestrel_core::frontend::{Frontend, Ingest};
use kestrel_core::linear::start_demod;
use kestrel_core::multicast;

#[derive(Parser, Debug)]
#[command(author, version, about = "Kestrel multichannel receiver daemon", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();

    let level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();

    let cfg = config::load(&args.config)?;

    let fe = Arc::new(Frontend::new(
        cfg.device.description.clone(),
        false,
        16,
    ));
    let mut driver = drivers::create(&cfg.device.device)?;
    driver
        .setup(&fe, &cfg.device, &cfg.global.state_dir)
        .wrap_err("front end setup failed")?;
    let driver: status_loop::SharedDriver = Arc::new(Mutex::new(driver));

    // The forward filter cannot exist until the stream parameters are known
    let samprate = fe.wait_samprate();
    let params = FilterParams::derive(samprate, cfg.global.blocktime, cfg.global.overlap)?;
    fe.filter_l.store(params.l, Ordering::Relaxed);
    fe.filter_m.store(params.m, Ordering::Relaxed);
    log::info!(
        "front end at {} Hz: L={} M={} N={}",
        samprate,
        params.l,
        params.m,
        params.n()
    );

    let bus = SpectrumBus::new();
    let ingest = Ingest::new(
        Arc::clone(&fe),
        FilterInput::new(params, Arc::clone(&bus)),
    );
    driver
        .lock()
        .unwrap()
        .start(ingest)
        .wrap_err("front end start failed")?;

    // One multicast group carries device and channel traffic both ways
    let group_spec = cfg
        .device
        .status
        .clone()
        .unwrap_or_else(|| cfg.global.status.clone());
    let group = multicast::resolve(&group_spec, multicast::DEFAULT_STATUS_PORT)
        .wrap_err_with(|| format!("bad status group {group_spec:?}"))?;
    let ttl = if cfg.device.status.is_some() {
        cfg.device.ttl
    } else {
        cfg.global.ttl
    };
    log::info!("status plane on {}", group);

    let table = Arc::new(ChannelTable::new());

    // Static channels from the config file
    for section in &cfg.channels {
        let chan = table
            .setup(section.ssrc)
            .wrap_err_with(|| format!("channel ssrc {}", section.ssrc))?;
        let chan_cfg = section.to_chan_config()?;
        chan.update_config(|cfg| *cfg = chan_cfg.clone());
        if section.lifetime > 0 {
            chan.lifetime.store(section.lifetime, Ordering::Release);
        }
        start_demod(&chan, &fe, &bus, params);
        log::info!(
            "channel {:#010x}: {} at {:.0} Hz",
            section.ssrc,
            section.mode,
            section.frequency
        );
    }

    {
        let fe = Arc::clone(&fe);
        let driver = Arc::clone(&driver);
        let recv = multicast::listen(group)?;
        let send = multicast::connect(group, ttl)?;
        std::thread::Builder::new()
            .name("fe-cmd".into())
            .spawn(move || status_loop::frontend_command_loop(fe, driver, recv, send))?;
    }
    {
        let table = Arc::clone(&table);
        let fe = Arc::clone(&fe);
        let bus = Arc::clone(&bus);
        let recv = multicast::listen(group)?;
        let send = multicast::connect(group, ttl)?;
        std::thread::Builder::new()
            .name("chan-ctl".into())
            .spawn(move || {
                status_loop::channel_control_loop(table, fe, bus, params, recv, send)
            })?;
    }
    let (_reaper_stop, _reaper) = spawn_reaper(Arc::clone(&table));

    // The monitor owns the main thread; device death ends the process
    status_loop::monitor_loop(fe, driver)
}
