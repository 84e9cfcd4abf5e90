// Runs the calibration engine against a simulated mote and scripted peer
use anyhow::{ensure, Context, Result};
use clap::Parser;
use intercal::sim::{SimConfig, SimMote};
use intercal::telemetry::Report;
use intercal::{Config, Engine, Error, Irq, Role};
use std::{
    fs::read_to_string,
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};
use tracing::{info, Level};

#[derive(Parser, Debug)]
/// Try it out: `intercal-sim -vv --loss 0.1`
///             `intercal-sim -t 10035` with `socat UDP-LISTEN:10035 STDOUT`
struct Args {
    /// TOML overrides, merged over the preset for the file's role
    #[arg(short, long)]
    config: Option<String>,
    /// Use the responder preset when no config file is given
    #[arg(short, long)]
    responder: bool,
    /// Simulated seconds of steady state after the peer starts its period
    #[arg(short, long, default_value_t = 30)]
    seconds: u64,
    #[arg(long, default_value_t = 1)]
    seed: u64,
    /// Chance any frame is lost
    #[arg(short, long, default_value_t = 0.0)]
    loss: f64,
    /// LC drift in Hz per second
    #[arg(short, long, default_value_t = 0.0)]
    drift: f64,
    /// Stream CBOR reports to this local UDP port
    #[arg(short, long)]
    telemetry: Option<u16>,
    #[arg(short, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let config = match &args.config {
        Some(path) => {
            let contents = read_to_string(path).with_context(|| format!("Reading {path}"))?;
            Config::from_toml(&contents).with_context(|| format!("Loading {path}"))?
        }
        None if args.responder => Config::preset(Role::Responder),
        None => Config::preset(Role::Initiator),
    };
    ensure!(
        (0.0..=1.0).contains(&args.loss),
        "Loss must be a probability, got {}",
        args.loss
    );

    let mut sim = SimConfig::new(&config);
    sim.seed = args.seed;
    sim.loss = args.loss;
    sim.lc_drift_hz_per_s = args.drift;
    sim.horizon_ticks = sim.first_exchange(&config) + args.seconds * u64::from(config.timing.timer_hz);

    let socket = match args.telemetry {
        Some(port) => {
            let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))?;
            socket.connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))?;
            Some(socket)
        }
        None => None,
    };

    let irq = Irq::new();
    let mut engine = Engine::new(SimMote::new(&irq, &config, sim), &irq, config);
    engine.boot().context("Boot check failed")?;

    let stopped = loop {
        if let Err(e) = engine.step() {
            break e;
        }
        if let Some(socket) = &socket {
            Report::Session(engine.session()).send(socket)?;
            Report::Telemetry(*engine.telemetry()).send(socket)?;
        }
    };
    match stopped {
        Error::Halted => info!("Reached the end of the simulation"),
        e => return Err(e).context("Engine stopped"),
    }

    let session = engine.session();
    let mote = engine.mote();
    println!("{:#?}", engine.telemetry());
    println!("{:#?}", session);
    println!("{:#?}", mote.stats());
    println!(
        "RX error {} Hz, TX error {} Hz, RC error {} Hz",
        mote.rx_error_hz(session.rx.primary),
        mote.tx_error_hz(session.tx.primary),
        mote.rc_error_hz()
    );
    Ok(())
}
