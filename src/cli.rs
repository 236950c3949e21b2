use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, ValueEnum};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Manager settings file (JSON)
    #[clap(long)]
    pub settings: Option<PathBuf>,

    /// Baud rate for the connection
    #[clap(long, default_value = "4800")]
    pub baud_rate: i32,

    /// Data bits for the connection (5-8)
    #[clap(long, default_value = "8")]
    pub data_bits: i32,

    /// Connect automatically whenever a meter is attached
    #[clap(long)]
    pub auto_connect: bool,

    /// Use a simulated meter instead of the system's USB ports
    #[clap(long)]
    pub simulate: bool,

    /// How long to wait for the connection to open, in seconds
    #[clap(long, default_value = "10")]
    pub connect_wait_secs: u64,

    /// Timeout for each exchange, in milliseconds
    #[clap(long, default_value = "1000")]
    pub timeout_ms: u64,

    /// Request to send, as hex (e.g. 0d0a). May be repeated
    #[clap(long)]
    pub query: Vec<HexBytes>,

    /// Keep running and print hotplug events until Ctrl-C
    #[clap(long)]
    pub watch: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexBytes(pub Vec<u8>);

impl FromStr for HexBytes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s
            .trim_start_matches("0x")
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        if !digits.is_ascii() {
            return Err(format!("'{}' is not valid hex", s));
        }
        if digits.is_empty() || digits.len() % 2 != 0 {
            return Err(format!("'{}' is not an even number of hex digits", s));
        }

        (0..digits.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&digits[i..i + 2], 16)
                    .map_err(|_| format!("'{}' is not valid hex", s))
            })
            .collect::<Result<Vec<u8>, String>>()
            .map(HexBytes)
    }
}

impl fmt::Display for HexBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}
