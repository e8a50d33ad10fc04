//! Operator front end: connects the reader, loads a customer configuration
//! from the ERP and runs the provisioning session until Ctrl-C.
//!
//! While a session runs, single letter commands on stdin start the
//! maintenance routines: `f` formats the key on the reader, `i` reads it,
//! `q` ends the session.

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use keycreator_core::{AppConfig, ReaderConfig};
use keycreator_erp::{ErpClient, HttpErpClient};
use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, SerialLink, Twn4Reader};
use keycreator_session::{
    FormatReport, Maintenance, Reading, SessionCoordinator, SessionHandle, TagInspection,
};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "keycreator", version, about = "Provision RFID keys through a TWN4 reader")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the serial ports of this machine
    Ports,
    /// List the transponder configurations known to the ERP
    Configs,
    /// Provision keys for one customer until Ctrl-C
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Customer whose configuration is loaded; overrides session.customer
    #[arg(long, short)]
    customer: Option<String>,

    /// First serial number, six digits; overrides session.start_number
    #[arg(long, short)]
    start: Option<String>,

    /// Register the keys as test keys
    #[arg(long)]
    test_key: bool,

    /// No beeps
    #[arg(long)]
    mute: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load().context("loading configuration")?;

    match cli.command {
        Command::Ports => {
            for port in SerialLink::available_ports() {
                println!("{port}");
            }
            Ok(())
        }
        Command::Configs => {
            let erp = HttpErpClient::new(&config.erp)?;
            for summary in erp.list_configurations().await? {
                println!("{:<12} {}", summary.customer, summary.label());
            }
            Ok(())
        }
        Command::Run(args) => run(config, args).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect(config: &ReaderConfig) -> anyhow::Result<Twn4Reader> {
    let link = SerialLink::open(config).with_context(|| format!("opening {}", config.port))?;
    let (channel, _worker) =
        CommandChannel::spawn(AnyLink::Serial(link), ChannelOptions::from(config));
    let reader = Twn4Reader::new(channel);
    let version = reader.version_string().await?;
    println!("Reader {version} on {}", config.port);
    Ok(reader)
}

async fn run(mut config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let Some(customer) = args.customer.or(config.session.customer.take()) else {
        bail!("no customer, pass --customer or set session.customer");
    };
    let start = args.start.or(config.session.start_number.take());
    config.session.test_key |= args.test_key;

    let reader = connect(&config.reader).await?;
    let erp = HttpErpClient::new(&config.erp)?;
    let transponder = erp
        .get_configuration(&customer)
        .await
        .with_context(|| format!("loading configuration of {customer}"))?;
    println!(
        "Configuration {} requires {}",
        transponder.name,
        transponder.required_technologies()
    );

    let grace = config.session.maintenance_grace();
    let mut coordinator = SessionCoordinator::new(reader.clone(), erp.clone(), config.session);
    coordinator.set_muted(args.mute);
    let session = coordinator.start_session(transponder, start.as_deref())?;
    let handle = coordinator.handle();

    let mut maintenance = Maintenance::new(reader, erp, handle.clone(), grace);
    maintenance.set_muted(args.mute);

    println!("Session {session} running: f = format, i = inspect, q = quit");
    let (result, ()) = tokio::join!(
        async {
            let result = coordinator.run().await;
            handle.cancel();
            result
        },
        operator(&maintenance, &handle),
    );
    result?;

    if let Some(context) = coordinator.context() {
        println!(
            "Session {session} done: {} provisioned, {} rejected, next number {}",
            context.provisioned(),
            context.rejected(),
            coordinator
                .current_number()
                .map(|n| n.to_padded())
                .unwrap_or_default()
        );
    }
    Ok(())
}

/// Stdin commands and Ctrl-C, until the session ends.
async fn operator<E: ErpClient>(maintenance: &Maintenance<E>, handle: &SessionHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut check = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => match line.trim() {
                    "f" | "format" => match maintenance.format().await {
                        Ok(report) => print_format(&report),
                        Err(err) => warn!(error = %err, "Format aborted"),
                    },
                    "i" | "inspect" => match maintenance.inspect().await {
                        Ok(inspections) => inspections.iter().for_each(print_inspection),
                        Err(err) => warn!(error = %err, "Inspect aborted"),
                    },
                    "q" | "quit" => handle.cancel(),
                    "" => {}
                    other => println!("Unknown command {other:?}: f, i or q"),
                },
                Ok(None) | Err(_) => stdin_open = false,
            },
            signal = tokio::signal::ctrl_c() => {
                if signal.is_ok() {
                    info!("Ctrl-C, stopping session");
                }
                handle.cancel();
            }
            _ = check.tick() => {
                if handle.is_cancelled() {
                    return;
                }
            }
        }
    }
}

fn print_format(report: &FormatReport) {
    for tag in &report.formatted {
        println!("formatted  {tag}");
    }
    for tag in &report.skipped {
        println!("skipped    {tag} (no ERP record)");
    }
    for (tag, err) in &report.failed {
        println!("FAILED     {tag}: {err}");
    }
    for code in &report.deleted {
        println!("deleted    record {code}");
    }
    if report.formatted.is_empty() && report.skipped.is_empty() && report.failed.is_empty() {
        println!("No key on the reader");
    }
}

fn print_inspection(inspection: &TagInspection) {
    let code = inspection
        .record
        .as_ref()
        .map(|r| r.code.as_str())
        .unwrap_or("-");
    match &inspection.reading {
        Ok(Reading::Hitag(value)) => println!("{} record {code} payload {value}", inspection.detection),
        Ok(Reading::Classic(readout)) if readout.default_key => {
            println!("{} record {code} blank (transport key)", inspection.detection)
        }
        Ok(Reading::Classic(readout)) => {
            println!("{} record {code} number {:06}", inspection.detection, readout.value)
        }
        Ok(Reading::Desfire(value)) => {
            println!("{} record {code} number {value:06}", inspection.detection)
        }
        Ok(Reading::FixedId) => println!("{} record {code}", inspection.detection),
        Err(err) => println!("{} record {code} unreadable: {err}", inspection.detection),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[rstest]
    #[case(&["keycreator", "run", "-c", "CUST-1", "-s", "200017"], Some("CUST-1"), Some("200017"))]
    #[case(&["keycreator", "run"], None, None)]
    fn test_run_arguments(
        #[case] argv: &[&str],
        #[case] customer: Option<&str>,
        #[case] start: Option<&str>,
    ) {
        let Command::Run(args) = Cli::parse_from(argv).command else {
            panic!("expected run");
        };
        assert_eq!(args.customer.as_deref(), customer);
        assert_eq!(args.start.as_deref(), start);
        assert!(!args.mute);
    }
}
