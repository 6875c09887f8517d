use std::io::Write;
use std::process::ExitCode;
use std::time::Duration;

use blesession::{
    common::{characteristics::TARGET_CHARACTERISTIC, services::TARGET_SERVICE},
    parse_hex, AddressType, BDAddr, BtleplugTransport, Error, ExitStatus, ParseHexError,
    ScanConfig, SessionConfig, SessionDriver, Strictness, NOTIFICATION_TARGET,
};
use clap::{Parser, ValueEnum};
use log::LevelFilter;
use pretty_env_logger::env_logger::Builder;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ble-session")]
#[command(
    about = "Scan, connect, subscribe, write and listen to nearby BLE peripherals",
    long_about = None
)]
#[command(version)]
struct Cli {
    /// Bluetooth adapter index (0 = hci0, 1 = hci1, ...)
    #[arg(long, default_value_t = 0)]
    adapter: usize,
    /// Length of the scan window in seconds
    #[arg(long, default_value = "3", value_parser = parse_seconds)]
    scan_secs: Duration,
    /// Weakest signal (dBm) a device may have to be connected to
    #[arg(long, default_value_t = -70, allow_negative_numbers = true)]
    min_rssi: i16,
    /// Seconds to wait for a connection before giving up on the device
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    connect_timeout: Duration,
    /// Address type of the peripherals. The host Bluetooth stack learns it from
    /// the advertisement, so this has no effect on real adapters
    #[arg(long, value_enum, default_value_t = AddressKind::Public)]
    address_type: AddressKind,
    /// Only connect to the device with this address
    #[arg(long)]
    address: Option<BDAddr>,
    /// Only connect to devices whose name starts with this
    #[arg(long)]
    name: Option<String>,
    #[arg(long, default_value_t = TARGET_SERVICE)]
    service: Uuid,
    #[arg(long, default_value_t = TARGET_CHARACTERISTIC)]
    characteristic: Uuid,
    /// Hex payload written as a command; repeat for a sequence
    #[arg(long = "payload", value_parser = parse_payload)]
    payloads: Vec<Payload>,
    /// Hex payload written as an acknowledged request after the commands
    #[arg(long, value_parser = parse_payload)]
    request: Option<Payload>,
    /// Do not read back a response after the request
    #[arg(long)]
    no_read: bool,
    /// Skip devices whose discovery or subscription fails
    #[arg(long)]
    strict: bool,
    /// Listen for this many seconds per device instead of until interrupted
    #[arg(long, value_parser = parse_seconds)]
    listen_secs: Option<Duration>,
    /// Only show errors and notifications
    #[arg(short, long)]
    quiet: bool,
    /// Do not run `bluetoothctl power on` before scanning
    #[arg(long)]
    no_power_on: bool,
}

#[derive(Clone)]
struct Payload(Vec<u8>);

fn parse_seconds(text: &str) -> Result<Duration, String> {
    let seconds = text
        .parse::<f64>()
        .map_err(|error| format!("{:?} is not a number: {}", text, error))?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(format!("{:?} is not a valid number of seconds", text));
    }
    Duration::try_from_secs_f64(seconds).map_err(|error| error.to_string())
}

fn parse_payload(text: &str) -> Result<Payload, ParseHexError> {
    parse_hex(text).map(Payload)
}

#[derive(Clone, Copy, ValueEnum)]
enum AddressKind {
    Public,
    Random,
}

impl From<AddressKind> for AddressType {
    fn from(kind: AddressKind) -> Self {
        match kind {
            AddressKind::Public => AddressType::Public,
            AddressKind::Random => AddressType::Random,
        }
    }
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        let mut scan = ScanConfig::default()
            .adapter_index(self.adapter)
            .duration(self.scan_secs)
            .minimum_rssi(self.min_rssi);
        if let Some(wanted) = self.address {
            scan = scan.filter_by_address(move |address| address == wanted);
        }
        if let Some(prefix) = self.name.clone() {
            scan = scan.filter_by_name(move |name| name.starts_with(&prefix));
        }

        let mut config = SessionConfig::default()
            .scan(scan)
            .connection_timeout(self.connect_timeout)
            .address_type(self.address_type.into())
            .target(self.service, self.characteristic)
            .read_response(!self.no_read)
            .listen_for(self.listen_secs)
            .debug(!self.quiet);
        if !self.payloads.is_empty() {
            config = config.payloads(
                self.payloads
                    .iter()
                    .map(|payload| payload.0.clone())
                    .collect(),
            );
        }
        if let Some(request) = &self.request {
            config = config.request(request.0.clone());
        }
        if self.strict {
            config = config.strictness(Strictness::Strict);
        }

        config
    }
}

fn logger(debug: bool, overrides: Option<&str>) -> Builder {
    let mut builder = pretty_env_logger::formatted_builder();
    builder
        .format(|buf, record| {
            let marker = if record.level() <= log::Level::Warn {
                "[-]"
            } else {
                "[*]"
            };
            writeln!(buf, "{} {}", marker, record.args())
        })
        .filter_level(if debug {
            LevelFilter::Info
        } else {
            LevelFilter::Warn
        })
        .filter_module(NOTIFICATION_TARGET, LevelFilter::Info);

    if let Some(filters) = overrides {
        builder.parse_filters(filters);
    }

    builder
}

fn init_logger(debug: bool) {
    logger(debug, std::env::var("RUST_LOG").ok().as_deref()).init();
}

/// Makes sure the adapter is powered. Failure is not fatal: the scan reports
/// an unusable radio on its own.
async fn power_on_adapter() {
    log::info!("Setting up bluetoothctl");

    match tokio::process::Command::new("bluetoothctl")
        .args(["power", "on"])
        .status()
        .await
    {
        Ok(status) if status.success() => {}
        Ok(status) => log::warn!("bluetoothctl power on exited with {}", status),
        Err(error) => log::warn!("Could not run bluetoothctl: {}", error),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let config = cli.session_config();
    init_logger(config.is_debug());

    if !cli.no_power_on {
        power_on_adapter().await;
    }

    let result = match BtleplugTransport::new(config.get_scan().get_adapter_index()).await {
        Ok(transport) => {
            let mut driver = SessionDriver::new(transport, config);
            driver
                .run_until(async {
                    if let Err(error) = tokio::signal::ctrl_c().await {
                        log::error!("Could not listen for Ctrl-C: {}", error);
                        futures::future::pending::<()>().await;
                    }
                })
                .await
        }
        Err(error) => Err(Error::RadioUnavailable(error)),
    };

    match &result {
        Ok(summary) => log::info!(
            "Done. {} devices scanned, {} candidates, {} processed.",
            summary.scanned,
            summary.candidates,
            summary.devices.len()
        ),
        Err(Error::UserInterrupt) => {}
        Err(error) => log::error!("{}", error),
    }

    ExitStatus::from(&result).into()
}
