use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use hostlink_frame::InterfaceType;
use hostlink_spi::{DeassertPolicy, Polarity, SpiConfig};

use crate::exit::{spi_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod caps;
pub mod decode;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the transport against an in-memory host and report counters.
    Simulate(SimulateArgs),
    /// Print the capability record advertised at startup.
    Caps(CapsArgs),
    /// Decode a frame from a hex dump.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, config: Option<&Path>, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Simulate(args) => simulate::run(args, load_config(config)?, format),
        Command::Caps(args) => caps::run(args, load_config(config)?, format),
        Command::Decode(args) => decode::run(args, load_config(config)?, format),
        Command::Version(args) => version::run(args),
    }
}

/// Defaults, or the JSON file given with `--config`.
pub fn load_config(path: Option<&Path>) -> CliResult<SpiConfig> {
    match path {
        Some(path) => SpiConfig::from_file(path).map_err(|err| spi_error("config", err)),
        None => Ok(SpiConfig::default()),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum PolicyArg {
    /// Drop Handshake when the transfer completes.
    TransactionEnd,
    /// Drop Handshake when the host releases chip-select.
    ChipSelect,
}

impl From<PolicyArg> for DeassertPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::TransactionEnd => DeassertPolicy::OnTransactionEnd,
            PolicyArg::ChipSelect => DeassertPolicy::OnChipSelect,
        }
    }
}

/// Overrides shared by commands that build frames.
#[derive(Args, Debug, Default)]
pub struct FrameOverrides {
    /// Disable frame checksums.
    #[arg(long)]
    pub no_checksum: bool,
}

impl FrameOverrides {
    pub fn apply(&self, config: &mut SpiConfig) {
        if self.no_checksum {
            config.frame.checksum = false;
        }
    }
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Frames the slave submits.
    #[arg(long, default_value = "16")]
    pub frames: usize,
    /// Frames the host sends to the slave (station traffic).
    #[arg(long, default_value = "8")]
    pub host_frames: usize,
    /// Interfaces the slave cycles through (comma-separated).
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "sta,hci,serial",
        value_parser = parse_interface
    )]
    pub interfaces: Vec<InterfaceType>,
    /// Payload bytes per frame.
    #[arg(long, default_value = "64")]
    pub payload_size: usize,
    /// How long the host waits for Handshake per exchange (e.g. 1s, 200ms).
    #[arg(long, default_value = "1s")]
    pub timeout: String,
    /// Keep clocking dummy exchanges until Ctrl-C.
    #[arg(long)]
    pub forever: bool,
    /// Handshake deassert policy.
    #[arg(long, value_name = "POLICY")]
    pub policy: Option<PolicyArg>,
    /// Drive Handshake and DataReady active-low.
    #[arg(long)]
    pub active_low: bool,
    #[command(flatten)]
    pub frame: FrameOverrides,
}

#[derive(Args, Debug)]
pub struct CapsArgs {
    /// Chip identifier to advertise.
    #[arg(long)]
    pub chip_id: Option<u8>,
    /// Do not advertise Bluetooth.
    #[arg(long)]
    pub no_bluetooth: bool,
    #[command(flatten)]
    pub frame: FrameOverrides,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex.
    #[arg(conflicts_with = "file", required_unless_present = "file")]
    pub hex: Option<String>,
    /// Read raw frame bytes from a file.
    #[arg(long)]
    pub file: Option<PathBuf>,
    #[command(flatten)]
    pub frame: FrameOverrides,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

fn parse_interface(input: &str) -> Result<InterfaceType, String> {
    InterfaceType::from_name(input.trim())
        .filter(|ty| ty.carries_data())
        .ok_or_else(|| format!("unknown interface: {input}"))
}

pub fn apply_polarity(config: &mut SpiConfig, active_low: bool) {
    if active_low {
        config.handshake.polarity = Polarity::ActiveLow;
        config.data_ready.polarity = Polarity::ActiveLow;
    }
}

pub fn parse_timeout(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "timeout must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid timeout value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "timeout must be greater than zero"));
    }

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        _ => Ok(Duration::from_secs(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_timeout_seconds() {
        assert_eq!(parse_timeout("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_timeout("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_timeout_millis() {
        assert_eq!(parse_timeout("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_timeout_invalid() {
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("bad").is_err());
    }

    #[test]
    fn interface_names_are_case_insensitive() {
        assert_eq!(parse_interface("hci").unwrap(), InterfaceType::Hci);
        assert_eq!(parse_interface("STA").unwrap(), InterfaceType::Station);
        assert!(parse_interface("dummy").is_err());
        assert!(parse_interface("wifi").is_err());
    }

    #[test]
    fn active_low_flips_both_outputs() {
        let mut config = SpiConfig::default();
        apply_polarity(&mut config, true);
        assert_eq!(config.handshake.polarity, Polarity::ActiveLow);
        assert_eq!(config.data_ready.polarity, Polarity::ActiveLow);
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/hostlink.json"))).unwrap_err();
        assert_eq!(err.code, crate::exit::CONFIG_ERROR);
    }
}
