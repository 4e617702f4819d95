//! Detect a Modbus RTU slave and print its link settings.
//!
//!   cargo run --example detect -- /dev/ttyUSB0 1-10
//!   cargo run --example detect -- --config scan.json
//!   cargo run --example detect -- --sim
//!   cargo run --example detect -- --list
//!
//! `--sim` scans a simulated slave (ID 17, 19200 8N1) instead of a real port.
//! Set RUST_LOG=debug for per-tuple detail.

use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use rtu_autodetect::mock::{Identity, MockDevice, MockTransport};
use rtu_autodetect::progress::format_hms;
use rtu_autodetect::*;

/// Find the baud rate, framing and unit address of a Modbus RTU slave
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port to scan (see --list)
    #[arg(required_unless_present_any = ["config", "sim", "list"])]
    port: Option<String>,

    /// Device-ID range to try, as START-END
    #[arg(value_parser = parse_range)]
    range: Option<(String, String)>,

    /// Load the whole scan configuration from a JSON file
    #[arg(long, value_name = "FILE", conflicts_with_all = ["port", "sim"])]
    config: Option<PathBuf>,

    /// Scan a simulated slave instead of a real port
    #[arg(long, conflicts_with = "port")]
    sim: bool,

    /// List serial ports and exit
    #[arg(long)]
    list: bool,
}

fn parse_range(s: &str) -> Result<(String, String), String> {
    s.split_once('-')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| format!("expected START-END, got {s:?}"))
}

fn main() -> Result<(), AutoDetectError> {
    env_logger::init();
    let args = Args::parse();

    if args.list {
        for port in find_ports() {
            println!("{port}");
        }
        return Ok(());
    }

    let (config, simulate) = if let Some(path) = &args.config {
        (ScanConfig::load(path)?, false)
    } else if args.sim {
        let mut c = ScanConfig::new("SIM");
        c.id_end = 32;
        (c, true)
    } else {
        let mut c = ScanConfig::new(args.port.clone().unwrap_or_default());
        if let Some((start, end)) = &args.range {
            c = c.with_id_range_str(start, end)?;
        }
        (c, false)
    };

    let plan = ScanPlan::new(&config)?;
    println!(
        "Scanning {} ({} tuples x {} ids, {} trials planned)",
        plan.port,
        plan.space.tuple_count(),
        plan.trial_ids.len(),
        plan.total_trials()
    );

    let (tx, rx) = mpsc::channel::<ScanEvent>();
    let mut scan = ScanController::new(config.clone());
    if simulate {
        let clock = ManualClock::new();
        let link = SerialTuple {
            baud_rate: 19200,
            parity: Parity::None,
            data_bits: 8,
            stop_bits: StopBits::One,
        };
        let bus = MockTransport::new(clock.clone())
            .with_device(
                MockDevice::new(link, 17)
                    .registers(|addr| 0x1000 + addr)
                    .latency(vec![Duration::from_millis(12), Duration::from_millis(14)])
                    .identity(Identity::DeviceId),
            )
            .read_delay(Duration::from_micros(200));
        scan = scan.with_clock(clock);
        scan.start(bus, tx)?;
    } else {
        scan.start(SerialTransport::new(), tx)?;
    }

    let mut outcome = ScanOutcome::NotFound;
    for event in rx {
        match event {
            ScanEvent::Progress(p) => println!(
                "{:5.1}%  {:<24} elapsed {}  eta {}",
                p.percent,
                p.current.to_string(),
                format_hms(p.elapsed),
                format_hms(p.eta)
            ),
            ScanEvent::Complete(o) => outcome = o,
        }
    }
    scan.join()?;

    match outcome {
        ScanOutcome::Found(link) => {
            println!("\nConnected to {}", link.port);
            println!(
                "ID={}, {} {} {}{}",
                link.device_id, link.baud_rate, link.parity, link.data_bits, link.stop_bits
            );
            println!("Stability score: {:.2}", link.stability_score);
            println!("Total scan time: {}", format_hms(link.elapsed));
            let request = protocol::build_read_request(
                link.device_id,
                link.register_type.function_code(),
                config.register_start,
                1,
            );
            println!("First read request: {}", hex::encode(request));
        }
        ScanOutcome::NotFound => {
            println!("\nNo device answered with the tested settings.");
            std::process::exit(1);
        }
        ScanOutcome::Cancelled => println!("\nScan cancelled."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn port_and_range() {
        let args = Args::try_parse_from(["detect", "/dev/ttyUSB0", "3-12"]).unwrap();
        assert_eq!(args.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(args.range, Some(("3".into(), "12".into())));
        assert!(!args.sim);
    }

    #[test]
    fn sim_and_config_need_no_port() {
        assert!(Args::try_parse_from(["detect", "--sim"]).unwrap().sim);
        let args = Args::try_parse_from(["detect", "--config", "scan.json"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("scan.json")));
    }

    #[test]
    fn rejects_bad_invocations() {
        assert!(Args::try_parse_from(["detect"]).is_err());
        assert!(Args::try_parse_from(["detect", "COM3", "12"]).is_err());
        assert!(Args::try_parse_from(["detect", "COM3", "--sim"]).is_err());
    }
}
