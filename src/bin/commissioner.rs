//! Thread commissioner
//!
//! Petitions a Border Agent for the commissioner role, publishes steering
//! data for one joiner (or all joiners) and authenticates it with its PSKd.

use std::fs::File;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::Parser;
use log::LevelFilter;

use meshcop::mainloop::{Mainloop, MainloopContext};
use meshcop::meshcop::PSKC_LEN;
use meshcop::steering::{JoinerId, SteeringData, DEFAULT_STEERING_LEN, MAX_STEERING_LEN};
use meshcop::{Commissioner, Config, Pskc, Pskd};

/// Longest wait between two iterations of the main loop.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "commissioner")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Host of the Border Agent
    #[arg(short = 'H', long)]
    agent_host: String,

    /// UDP port of the Border Agent
    #[arg(short = 'P', long)]
    agent_port: u16,

    /// UTF-8 encoded network name
    #[arg(short = 'N', long, required_unless_present = "pskc")]
    network_name: Option<String>,

    /// Thread network password
    #[arg(short = 'C', long, required_unless_present = "pskc")]
    network_password: Option<String>,

    /// Extended PAN ID in hex
    #[arg(short = 'X', long, required_unless_present = "pskc")]
    xpanid: Option<String>,

    /// PSKc in hex, instead of deriving it from name, password and xpanid
    #[arg(long, conflicts_with_all = ["network_name", "network_password", "xpanid"])]
    pskc: Option<String>,

    /// Allow all joiners
    #[arg(short = 'A', long)]
    allow_all: bool,

    /// Joiner EUI-64 in hex
    #[arg(short = 'E', long, required_unless_present = "allow_all")]
    joiner_eui64: Option<String>,

    /// Joiner passphrase (PSKd)
    #[arg(short = 'D', long)]
    joiner_pskd: String,

    /// Steering data length (1..16)
    #[arg(short = 'L', long = "steering-length", alias = "steering-data-length", value_parser = clap::value_parser!(u8).range(1..=MAX_STEERING_LEN as i64))]
    steering_data_length: Option<u8>,

    /// Seconds between COMM_KA requests, 0 disables them
    #[arg(short = 'i', long, default_value_t = 15)]
    keep_alive_interval: u64,

    /// Syslog style debug level (0..7)
    #[arg(short = 'd', long, default_value_t = 3, value_parser = clap::value_parser!(u8).range(0..=7))]
    debug_level: u8,

    /// Log to this file instead of stderr
    #[arg(short = 'l', long)]
    log_file: Option<std::path::PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level_filter(args.debug_level));
    builder.parse_default_env();
    if let Some(path) = &args.log_file {
        let file = File::create(path).with_context(|| format!("open {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.try_init()?;
    Ok(())
}

/// Map a syslog priority onto a log level.
fn level_filter(debug_level: u8) -> LevelFilter {
    match debug_level {
        0..=3 => LevelFilter::Error,
        4 => LevelFilter::Warn,
        5 | 6 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

fn parse_hex<const N: usize>(what: &str, s: &str) -> anyhow::Result<[u8; N]> {
    let bytes = hex::decode(s).with_context(|| format!("invalid {}", what))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow::anyhow!("invalid {}: {} bytes, want {}", what, b.len(), N))
}

fn steering_data(args: &Args) -> anyhow::Result<SteeringData> {
    let len = match args.steering_data_length {
        Some(len) => len as usize,
        None if args.allow_all => 1,
        None => DEFAULT_STEERING_LEN,
    };
    let mut steering = SteeringData::new(len)?;
    if args.allow_all {
        steering.set_all();
        return Ok(steering);
    }
    let Some(eui64) = &args.joiner_eui64 else {
        bail!("missing joiner EUI-64");
    };
    let eui64: [u8; 8] = parse_hex("joiner EUI-64", eui64)?;
    steering.add_joiner(&JoinerId::from_eui64(&eui64));
    Ok(steering)
}

fn pskc(args: &Args) -> anyhow::Result<Pskc> {
    if let Some(pskc) = &args.pskc {
        let bytes: [u8; PSKC_LEN] = parse_hex("PSKc", pskc)?;
        return Ok(Pskc::new(bytes));
    }
    let (Some(name), Some(password), Some(xpanid)) =
        (&args.network_name, &args.network_password, &args.xpanid)
    else {
        bail!("network name, password and xpanid are required without --pskc");
    };
    if name.is_empty() || name.len() > 16 {
        bail!("network name length must be between 1 and 16");
    }
    if password.is_empty() || password.len() > 255 {
        bail!("network password length must be between 1 and 255");
    }
    let xpanid: [u8; 8] = parse_hex("xpanid", xpanid)?;
    Ok(Pskc::derive(password, &xpanid, name)?)
}

fn run(args: Args) -> anyhow::Result<()> {
    let pskd = Pskd::new(&args.joiner_pskd).context("illegal PSKd")?;
    let steering = steering_data(&args)?;
    let pskc = pskc(&args)?;

    let config = Config::builder()
        .keep_alive_interval(Duration::from_secs(args.keep_alive_interval))
        .build()?;

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let mut mainloop = Mainloop::new()?;
    let mut commissioner = Commissioner::new(Arc::new(config), pskc)?;
    commissioner.init_dtls(&args.agent_host, args.agent_port)?;

    while !commissioner
        .try_dtls_handshake(Instant::now())
        .context("dtls handshake with border agent")?
    {
        if !running.load(Ordering::SeqCst) {
            return Ok(());
        }
        wait(&mut mainloop, &mut commissioner)?;
    }
    log::info!("Connected to border agent");

    commissioner.petition(Instant::now())?;

    let mut joiner_set = false;
    while commissioner.is_valid() && running.load(Ordering::SeqCst) {
        let readiness = wait(&mut mainloop, &mut commissioner)?;
        commissioner.process(&readiness, Instant::now());

        if commissioner.is_accepted() && !joiner_set {
            commissioner.set_joiner(&pskd, &steering, Instant::now())?;
            joiner_set = true;
        }
    }

    if commissioner.is_valid() {
        log::info!("Stopping, {:?}", commissioner.stats());
        commissioner.resign(Instant::now());
        Ok(())
    } else {
        bail!("commissioner is no longer valid")
    }
}

fn wait(
    mainloop: &mut Mainloop,
    commissioner: &mut Commissioner,
) -> anyhow::Result<meshcop::mainloop::Readiness> {
    let now = Instant::now();
    let mut ctx = MainloopContext::new(now + POLL_INTERVAL);
    commissioner.update_fd_set(&mut ctx, now);
    Ok(mainloop.wait(&ctx)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec![
            "commissioner",
            "-H",
            "::1",
            "-P",
            "49191",
            "-N",
            "OpenThread",
            "-C",
            "123456",
            "-X",
            "1111111122222222",
            "-D",
            "J01NME",
        ];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn allow_all_defaults_to_one_byte() {
        let a = args(&["-A"]);
        let steering = steering_data(&a).unwrap();
        assert_eq!(steering.as_bytes(), &[0xFF]);
    }

    #[test]
    fn allow_all_fills_requested_length() {
        let a = args(&["-A", "-L", "4"]);
        assert_eq!(steering_data(&a).unwrap().as_bytes(), &[0xFF; 4]);
    }

    #[test]
    fn eui64_filter_uses_default_length() {
        let a = args(&["-E", "18b4300000000001"]);
        let steering = steering_data(&a).unwrap();
        assert_eq!(steering.len(), DEFAULT_STEERING_LEN);
        let id = JoinerId::from_eui64(&[0x18, 0xb4, 0x30, 0, 0, 0, 0, 1]);
        assert!(steering.contains(&id));
    }

    #[test]
    fn eui64_required_without_allow_all() {
        assert!(Args::try_parse_from([
            "commissioner", "-H", "::1", "-P", "1", "-N", "n", "-C", "p", "-X", "00", "-D", "J01NME"
        ])
        .is_err());
    }

    #[test]
    fn steering_length_is_bounded() {
        assert!(Args::try_parse_from([
            "commissioner", "-H", "::1", "-P", "1", "-N", "n", "-C", "p", "-X", "00", "-D",
            "J01NME", "-A", "-L", "17"
        ])
        .is_err());
    }

    #[test]
    fn syslog_levels_map_to_filters() {
        assert_eq!(level_filter(3), LevelFilter::Error);
        assert_eq!(level_filter(4), LevelFilter::Warn);
        assert_eq!(level_filter(6), LevelFilter::Info);
        assert_eq!(level_filter(7), LevelFilter::Debug);
    }

    #[test]
    fn pskc_replaces_network_credentials() {
        let a = Args::try_parse_from([
            "commissioner", "-H", "::1", "-P", "1", "-D", "J01NME", "-A", "--pskc",
            "00112233445566778899aabbccddeeff",
        ])
        .unwrap();
        assert_eq!(pskc(&a).unwrap().as_bytes()[15], 0xff);

        assert!(Args::try_parse_from([
            "commissioner", "-H", "::1", "-P", "1", "-D", "J01NME", "-A", "-N", "net", "--pskc",
            "00112233445566778899aabbccddeeff",
        ])
        .is_err());
    }

    #[test]
    fn network_name_is_bounded() {
        let a = args(&["-A"]);
        assert!(pskc(&a).is_ok());
        let mut long = args(&["-A"]);
        long.network_name = Some("x".repeat(17));
        assert!(pskc(&long).is_err());
    }

    #[test]
    fn xpanid_must_be_eight_bytes() {
        assert!(parse_hex::<8>("xpanid", "1122").is_err());
        assert_eq!(
            parse_hex::<8>("xpanid", "0011223344556677").unwrap(),
            [0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
    }
}
