use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use sales_sync_lib::commands::{self, ProcessPayload, RateChoice, SyncPayload};
use sales_sync_lib::events::{EventLog, Level, StatusEvent};
use sales_sync_lib::graph::GraphClient;
use sales_sync_lib::retry::ThreadSleeper;
use sales_sync_lib::AppConfig;
use std::process::ExitCode;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RatesArg {
    None,
    OpenData,
    Workbook,
    RemoteWorkbook,
}

#[derive(clap::Args, Debug)]
struct InputArgs {
    /// Accounting export (.xlsx).
    input: String,

    /// Where to save the processed workbook (default: Downloads/procesado_<name>.xlsx).
    #[arg(long, short)]
    output: Option<String>,

    /// Banner rows above the header row.
    #[arg(long)]
    header_offset: Option<usize>,

    /// Source for exchange rates still empty after reading the notes.
    #[arg(long, value_enum, default_value = "open-data")]
    rates: RatesArg,

    /// Local rate workbook, with `--rates workbook`.
    #[arg(long, value_name = "PATH")]
    rate_workbook: Option<String>,
}

impl InputArgs {
    fn payload(&self) -> Result<ProcessPayload, String> {
        let rates = match self.rates {
            RatesArg::None => RateChoice::None,
            RatesArg::OpenData => RateChoice::OpenData,
            RatesArg::RemoteWorkbook => RateChoice::RemoteWorkbook,
            RatesArg::Workbook => RateChoice::Workbook(
                self.rate_workbook
                    .clone()
                    .ok_or("--rates workbook needs --rate-workbook <PATH>")?,
            ),
        };
        Ok(ProcessPayload {
            input_path: self.input.clone(),
            output_path: self.output.clone(),
            header_offset: self.header_offset,
            rates,
        })
    }
}

#[derive(Parser)]
#[command(name = "sales-sync", version, about = "Clean sales exports and append them to the shared monthly workbook.")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Clean an export and save the processed workbook.
    Process(InputArgs),
    /// Clean an export and append its new rows to the remote workbook.
    Sync {
        #[command(flatten)]
        input: InputArgs,
        /// Remote workbook path; defaults to this month's file in the configured folder.
        #[arg(long)]
        remote: Option<String>,
        /// Rewrite every body row instead of appending after the existing ones.
        #[arg(long)]
        rewrite: bool,
        /// Do not save the processed workbook locally.
        #[arg(long)]
        no_artifact: bool,
    },
    /// Show which remote workbook this month's sync would target.
    Locate,
    /// Look up the exchange rate effective on a date (YYYY-MM-DD, default today).
    Rate { date: Option<NaiveDate> },
}

fn print_events(events: &[StatusEvent]) {
    for e in events {
        let tag = match e.level {
            Level::Info => "info",
            Level::Success => " ok ",
            Level::Warning => "warn",
            Level::Error => "FAIL",
        };
        match e.count {
            Some(n) => println!("[{}] {} ({})", tag, e.message, n),
            None => println!("[{}] {}", tag, e.message),
        }
    }
}

fn run(cli: Cli, config: AppConfig) -> Result<(), String> {
    let today = Local::now().date_naive();
    match cli.command {
        Command::Process(args) => {
            let result = commands::process_export(&config, &args.payload()?);
            print_events(&result.events);
            match result.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        Command::Sync {
            input,
            remote,
            rewrite,
            no_artifact,
        } => {
            let graph = GraphClient::connect(&config).map_err(|e| e.to_string())?;
            let payload = SyncPayload {
                process: input.payload()?,
                remote_path: remote,
                rewrite,
                skip_artifact: no_artifact,
            };
            let result = commands::sync_export(&config, &payload, &graph, &ThreadSleeper, today);
            print_events(&result.events);
            if let Some(path) = &result.remote_path {
                println!("{}: {} appended, {} duplicates", path, result.appended_count, result.duplicate_count);
            }
            match result.error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
        Command::Locate => {
            let graph = GraphClient::connect(&config).map_err(|e| e.to_string())?;
            let mut events = EventLog::new();
            let found = commands::locate_monthly_file(&config, &graph, today, &mut events);
            print_events(events.events());
            match found? {
                Some(item) => {
                    println!("{}", item.path);
                    Ok(())
                }
                None => Err("No workbook for the current month.".to_string()),
            }
        }
        Command::Rate { date } => {
            let date = date.unwrap_or(today);
            match commands::lookup_rate(&config, date)? {
                Some(rate) => {
                    println!("{} {}", date, rate);
                    Ok(())
                }
                None => Err(format!("No rate available for {}.", date)),
            }
        }
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(ChronoLocal::new("%Y-%m-%d %H:%M:%S".to_string()))
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();
    tracing::debug!(
        sheet = %config.workbook.sheet_name,
        folder = %config.remote.monthly_folder,
        remote = config.has_remote(),
        "configuration loaded"
    );

    match run(cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
