/// Modbus TCP Master
///
/// Command-line tool to read and write holding registers on a Modbus TCP device.
/// Writes are read back and verified unless `--no-verify` is given; a value that
/// reads back differently is reported as a warning, or as a failure with `--strict`.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser};
use serde_json::json;

use modbus_master::utils::format::format_register_table;
use modbus_master::utils::validation;
use modbus_master::{
    console_logger, ClientConfig, LoggingMode, ModbusTcpClient, RegisterClient, VerificationOutcome, VerifyPolicy,
    DEFAULT_TCP_PORT, DEFAULT_VERIFY_DELAY_MS,
};

const EXAMPLES: &str = "\
Examples:
  # Read 10 registers starting at address 0
  modbus_master --host 192.168.1.100 --read 0 10

  # Write value 1234 to register at address 5
  modbus_master --host 192.168.1.100 --write 5 1234

  # Write three registers starting at address 10, no read-back
  modbus_master --host 192.168.1.100 --write-multiple 10 1 2 3 --no-verify

  # Read registers with custom port and unit ID
  modbus_master --host 192.168.1.100 --port 5020 --unit 2 --read 100 5";

#[derive(Parser, Debug)]
#[command(
    name = "modbus_master",
    version,
    about = "Modbus TCP Master - Read and write holding registers",
    after_help = EXAMPLES
)]
struct Cli {
    /// Modbus server IP address or hostname
    #[arg(long, env = "MODBUS_HOST")]
    host: String,

    /// TCP port
    #[arg(long, env = "MODBUS_PORT", default_value_t = DEFAULT_TCP_PORT)]
    port: u16,

    /// Modbus unit/slave ID
    #[arg(long, default_value_t = 1)]
    unit: u8,

    /// Connection and request timeout in seconds
    #[arg(long, default_value_t = 3)]
    timeout: u64,

    #[command(flatten)]
    operation: Operation,

    /// Skip reading written registers back
    #[arg(long)]
    no_verify: bool,

    /// Pause between a write and its read-back, in milliseconds
    #[arg(long, default_value_t = DEFAULT_VERIFY_DELAY_MS)]
    verify_delay_ms: u64,

    /// Treat a read-back that differs from the written values as a failure
    #[arg(long, conflicts_with = "no_verify")]
    strict: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable debug logging and packet dumps
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Operation {
    /// Read COUNT registers starting at START address
    #[arg(long, num_args = 2, value_names = ["START", "COUNT"])]
    read: Option<Vec<u16>>,

    /// Write VALUE (uint16) to register at ADDRESS
    #[arg(long, num_args = 2, value_names = ["ADDRESS", "VALUE"], allow_negative_numbers = true)]
    write: Option<Vec<i64>>,

    /// Write VALUEs (uint16) to consecutive registers starting at ADDRESS
    #[arg(long, num_args = 2.., value_names = ["ADDRESS", "VALUE"], allow_negative_numbers = true)]
    write_multiple: Option<Vec<i64>>,
}

/// Register address from command-line input
fn parse_address(value: i64) -> Result<u16> {
    u16::try_from(value).with_context(|| format!("Address {} out of range (0-65535)", value))
}

/// Split `ADDRESS VALUE...` into an address and validated register values
fn parse_write_args(args: &[i64]) -> Result<(u16, Vec<u16>)> {
    let Some((&address, values)) = args.split_first() else {
        bail!("Missing write address");
    };
    let address = parse_address(address)?;
    let values = values
        .iter()
        .map(|&value| validation::register_value(value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((address, values))
}

/// Fail on a non-matching read-back when `strict` is set
fn enforce_verification(outcome: &VerificationOutcome, address: u16, strict: bool) -> Result<()> {
    if strict {
        outcome.clone().into_result(address)?;
    }
    Ok(())
}

struct Master {
    client: ModbusTcpClient,
    unit: u8,
    json: bool,
    strict: bool,
}

impl Master {
    fn say(&self, message: &str) {
        if !self.json {
            println!("{}", message);
        }
    }

    async fn read(&self, start: u16, count: u16) -> Result<()> {
        self.say(&format!("\nReading {} register(s) starting at address {}...", count, start));
        let values = self
            .client
            .read_holding_registers(start, count, self.unit)
            .await
            .context("Error reading registers")?;

        if self.json {
            println!("{}", json!({ "start": start, "values": values }));
        } else {
            println!("\n{}", "=".repeat(60));
            println!("{}", format_register_table(start, &values));
            println!("{}", "=".repeat(60));
        }
        Ok(())
    }

    async fn write(&self, address: u16, values: &[u16], verify: Option<VerifyPolicy>) -> Result<()> {
        match values {
            [value] => self.say(&format!(
                "\nWriting value {} (0x{:04X}) to register at address {}...",
                value, value, address
            )),
            _ => self.say(&format!(
                "\nWriting {} value(s) to registers starting at address {}...",
                values.len(),
                address
            )),
        }

        let Some(policy) = verify else {
            match values {
                [value] => self.client.write_single_register(address, *value, self.unit).await,
                _ => self.client.write_multiple_registers(address, values, self.unit).await,
            }
            .context("Error writing register")?;
            self.say(&format!("✓ Successfully wrote {:?} to register {}", values, address));
            if self.json {
                println!("{}", json!({ "address": address, "written": values }));
            }
            return Ok(());
        };

        let outcome = self
            .client
            .write_and_verify(address, values, self.unit, &policy)
            .await
            .context("Error writing register")?;
        self.say(&format!("✓ Successfully wrote {:?} to register {}", values, address));

        if self.json {
            println!("{}", json!({ "address": address, "written": values, "verification": outcome }));
            return enforce_verification(&outcome, address, self.strict);
        }
        match &outcome {
            VerificationOutcome::Match { values } => {
                println!("✓ Verified: register {} = {:?}", address, values);
            }
            VerificationOutcome::Partial { expected, observed } => {
                println!(
                    "⚠ Warning: read back only {} of {} value(s): {:?}",
                    observed.len(),
                    expected.len(),
                    observed
                );
            }
            VerificationOutcome::Mismatch { expected, observed } => {
                println!("⚠ Warning: read back {:?}, expected {:?}", observed, expected);
            }
        }
        enforce_verification(&outcome, address, self.strict)
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ClientConfig::new(&cli.host, cli.port)
        .with_unit_id(cli.unit)
        .with_timeout(Duration::from_secs(cli.timeout))
        .with_packet_logging(cli.verbose);
    let address = config.address();

    let mut client = ModbusTcpClient::connect(config)
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;
    if cli.verbose && !cli.json {
        let mut logger = console_logger!();
        logger.set_mode(LoggingMode::Both);
        client = client.with_logger(logger);
    }
    let master = Master { client, unit: cli.unit, json: cli.json, strict: cli.strict };
    master.say(&format!("✓ Connected to {}", address));

    let verify = (!cli.no_verify).then(|| VerifyPolicy::with_delay(Duration::from_millis(cli.verify_delay_ms)));
    let result = if let Some(read) = &cli.operation.read {
        master.read(read[0], read[1]).await
    } else if let Some(write) = &cli.operation.write {
        match parse_write_args(write) {
            Ok((address, values)) => master.write(address, &values, verify).await,
            Err(e) => Err(e),
        }
    } else if let Some(write) = &cli.operation.write_multiple {
        match parse_write_args(write) {
            Ok((address, values)) => master.write(address, &values, verify).await,
            Err(e) => Err(e),
        }
    } else {
        Err(anyhow::anyhow!("No operation given"))
    };

    master.client.close().await;
    master.say("✓ Disconnected");
    result
}

fn log_level(verbose: bool) -> log::LevelFilter {
    if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    env_logger::builder()
        .filter_level(log_level(cli.verbose))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("✗ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_operations_are_exclusive() {
        let cli = Cli::try_parse_from(["modbus_master", "--host", "h", "--read", "0", "10"]).unwrap();
        assert_eq!(cli.operation.read, Some(vec![0, 10]));
        assert_eq!(cli.port, 502);

        let both = Cli::try_parse_from([
            "modbus_master", "--host", "h", "--read", "0", "1", "--write", "0", "1",
        ]);
        assert!(both.is_err());

        let none = Cli::try_parse_from(["modbus_master", "--host", "h"]);
        assert!(none.is_err());
    }

    #[test]
    fn test_strict_verification() {
        let mismatch = VerificationOutcome::compare(&[1234], vec![0]);
        assert!(enforce_verification(&mismatch, 5, false).is_ok());

        let error = enforce_verification(&mismatch, 5, true).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<modbus_master::ClientError>(),
            Some(modbus_master::ClientError::VerificationMismatch { address: 5, .. })
        ));

        let matched = VerificationOutcome::compare(&[1234], vec![1234]);
        assert!(enforce_verification(&matched, 5, true).is_ok());

        let cli = Cli::try_parse_from(["modbus_master", "--host", "h", "--write", "5", "1", "--strict"]).unwrap();
        assert!(cli.strict);
        let both = Cli::try_parse_from([
            "modbus_master", "--host", "h", "--write", "5", "1", "--strict", "--no-verify",
        ]);
        assert!(both.is_err());
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(false), log::LevelFilter::Info);
        assert_eq!(log_level(true), log::LevelFilter::Debug);
    }

    #[test]
    fn test_write_args() {
        assert_eq!(parse_write_args(&[5, 1234]).unwrap(), (5, vec![1234]));
        assert!(parse_write_args(&[5, 65536]).is_err());
        assert!(parse_write_args(&[-1, 1]).is_err());
        assert_eq!(parse_write_args(&[10, 1, 2, 3]).unwrap(), (10, vec![1, 2, 3]));
    }
}
