//! Extract and convert DWC patient data.

use std::cell::RefCell;
use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use converter::archive::Archive;
use converter::config::{load_config, ConverterConfig};
use converter::db::DwcDb;
use converter::dispatch::DispatchSink;
use converter::extract::Extractor;
use converter::parallel::{child_main, ChildSpawnConfig, ParallelDispatcher};
use converter::worker::FinalizeMode;
use converter::{add_standard_queues, open_archive_and_dispatcher};
use dwc_core::DwcTimestamp;

/// Save state to disk after this many queries.
const FLUSH_EVERY: u32 = 500;

/// Re-create the extractor (and run stay-end detection) after this much
/// source time.
const SYNC_INTERVAL_MS: i64 = 3 * 3600 * 1000;

#[derive(Parser)]
#[command(name = "converter", about = "Extract and convert DWC patient data.")]
struct Cli {
    #[command(subcommand)]
    worker: Option<WorkerCommand>,

    /// Name of the DWC database server.
    #[arg(long, value_name = "NAME")]
    server: Option<String>,

    /// File containing server definitions and credentials.
    #[arg(long, value_name = "FILE", default_value = "server.conf")]
    password_file: PathBuf,

    /// Directory to store the output database.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Directory to store state files (defaults to the output directory).
    #[arg(long, value_name = "DIR")]
    state_dir: Option<PathBuf>,

    /// Initialize a new output database.
    #[arg(long)]
    init: bool,

    /// Process available data and exit.
    #[arg(long)]
    batch: bool,

    /// Collect data continuously.
    #[arg(long)]
    live: bool,

    /// Begin collecting data at the given time (with --init).
    #[arg(long, value_name = "TIME")]
    start: Option<String>,

    /// Collect data up to the given time (with --batch).
    #[arg(long, value_name = "TIME")]
    end: Option<String>,

    /// Handle final data after permanent shutdown.
    #[arg(long)]
    terminate: bool,
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// (internal) Finalize one record directory.
    #[command(name = "finalize-worker", hide = true)]
    FinalizeWorker {
        #[arg(long, value_name = "PATH")]
        record: PathBuf,
    },

    /// (internal) Run handlers over a message pipe.
    #[command(name = "handler-worker", hide = true)]
    HandlerWorker {
        #[arg(long, value_name = "NAME")]
        server: String,
        #[arg(long, value_name = "DIR")]
        output_dir: PathBuf,
        #[arg(long, value_name = "N")]
        index: usize,
        #[arg(long, value_name = "FILE", default_value = "server.conf")]
        password_file: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Some(worker) = cli.worker {
        return match worker {
            WorkerCommand::FinalizeWorker { record } => {
                converter::finalize::finalize_record(&record)?;
                Ok(())
            }
            WorkerCommand::HandlerWorker {
                server,
                output_dir,
                index: _,
                password_file,
            } => {
                let config = load_config(&password_file)?;
                let server_config = config.server(&server)?;
                let db = Rc::new(RefCell::new(DwcDb::open(
                    &server,
                    server_config.data_dirs.clone(),
                )?));
                let exe = std::env::current_exe()?;
                let (_archive, dispatcher) = open_archive_and_dispatcher(
                    &output_dir,
                    &db,
                    FinalizeMode::Worker { exe },
                    false,
                )?;
                child_main(dispatcher)?;
                Ok(())
            }
        };
    }

    let opts = validate_cli(&cli)?;
    let config = load_config(&cli.password_file)?;
    config.server(&opts.server)?;

    if opts.init {
        return init_mode(&config, &opts);
    }
    main_loop(&cli, &config, &opts)
}

struct Options {
    server: String,
    output_dir: PathBuf,
    state_dir: PathBuf,
    init: bool,
    batch: bool,
    live: bool,
    start: Option<DwcTimestamp>,
    end: Option<DwcTimestamp>,
    terminate: bool,
}

fn validate_cli(cli: &Cli) -> Result<Options, String> {
    let server = cli.server.clone().ok_or("no --server specified")?;
    let output_dir = cli.output_dir.clone().ok_or("no --output-dir specified")?;

    let modes = u8::from(cli.init) + u8::from(cli.batch) + u8::from(cli.live);
    if modes != 1 {
        return Err("must specify exactly one of --init, --batch, or --live".to_owned());
    }
    if cli.start.is_some() && !cli.init {
        return Err("--start can only be used with --init".to_owned());
    }
    if cli.end.is_some() && !cli.batch {
        return Err("--end can only be used with --batch".to_owned());
    }

    let parse_time = |arg: &Option<String>, name: &str| -> Result<Option<DwcTimestamp>, String> {
        match arg {
            None => Ok(None),
            Some(text) => text.parse().map(Some).map_err(|_| {
                format!("{name} is not in the format 'YYYY-MM-DD HH:MM:SS.SSS +ZZ:ZZ'")
            }),
        }
    };
    let start = parse_time(&cli.start, "--start")?;
    let end = parse_time(&cli.end, "--end")?;

    let state_dir = cli.state_dir.clone().unwrap_or_else(|| output_dir.clone());
    if cli.init {
        if state_dir.exists() {
            return Err(format!("directory {} already exists", state_dir.display()));
        }
        if output_dir.exists() {
            return Err(format!("directory {} already exists", output_dir.display()));
        }
    } else {
        if !state_dir.is_dir() {
            return Err(format!("directory {} does not exist", state_dir.display()));
        }
        if !output_dir.is_dir() {
            return Err(format!("directory {} does not exist", output_dir.display()));
        }
    }

    Ok(Options {
        server,
        output_dir,
        state_dir,
        init: cli.init,
        batch: cli.batch,
        live: cli.live,
        start,
        end,
        terminate: cli.terminate,
    })
}

/// Create the state and output directories and write the initial queue
/// checkpoints.
fn init_mode(config: &ConverterConfig, opts: &Options) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&opts.output_dir)?;
    std::fs::create_dir_all(&opts.state_dir)?;
    // --init never dispatches anything; an empty dispatcher will do.
    let dispatcher = Box::new(converter::dispatch::Dispatcher::new(false));
    let mut extractor = build_extractor(config, opts, dispatcher)?;
    extractor.flush()?;
    Ok(())
}

fn build_extractor(
    config: &ConverterConfig,
    opts: &Options,
    dispatcher: Box<dyn DispatchSink>,
) -> Result<Extractor, Box<dyn std::error::Error>> {
    let server_config = config.server(&opts.server)?;
    let db = Rc::new(RefCell::new(DwcDb::open(
        &opts.server,
        server_config.data_dirs.clone(),
    )?));
    let mut extractor = Extractor::new(Rc::clone(&db), Some(&opts.state_dir), dispatcher)?;
    add_standard_queues(
        &mut extractor,
        opts.start,
        opts.end,
        config.messages_per_batch,
        config.patient_mapping_delay_ms,
    )?;
    Ok(extractor)
}

fn main_loop(
    cli: &Cli,
    config: &ConverterConfig,
    opts: &Options,
) -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?;

    // Feed data from the extractor into the archive until the desired
    // end point. The extractor and archive are re-created periodically
    // so that records can be finalized at the end of a stay; with
    // handler workers, each worker only knows about the patients
    // delegated to it, so stay-end detection has to happen here between
    // cycles.
    loop {
        let server_config = config.server(&opts.server)?;
        let db = Rc::new(RefCell::new(DwcDb::open(
            &opts.server,
            server_config.data_dirs.clone(),
        )?));

        let parent_archive: Option<Rc<RefCell<Archive>>>;
        let dispatcher: Box<dyn DispatchSink> = if config.handler_workers > 0 {
            parent_archive = None;
            Box::new(ParallelDispatcher::new(
                config.handler_workers,
                config.pending_limit,
                ChildSpawnConfig {
                    exe: exe.clone(),
                    config: Some(cli.password_file.clone()),
                    server: opts.server.clone(),
                    output_dir: opts.output_dir.clone(),
                },
            ))
        } else {
            let (archive, dispatcher) = open_archive_and_dispatcher(
                &opts.output_dir,
                &db,
                FinalizeMode::Worker { exe: exe.clone() },
                false,
            )?;
            parent_archive = Some(archive);
            Box::new(dispatcher)
        };

        let mut extractor = Extractor::new(Rc::clone(&db), Some(&opts.state_dir), dispatcher)?;
        add_standard_queues(
            &mut extractor,
            None,
            opts.end,
            config.messages_per_batch,
            config.patient_mapping_delay_ms,
        )?;

        // Stay-end detection: anything idle for longer than the split
        // interval is finalized now, before new messages arrive.
        let sync_time = extractor.fully_processed_timestamp();
        {
            let stay_end_archive = match &parent_archive {
                Some(archive) => Rc::clone(archive),
                None => Rc::new(RefCell::new(Archive::open(
                    &opts.output_dir,
                    FinalizeMode::Worker { exe: exe.clone() },
                )?)),
            };
            let mut archive = stay_end_archive.borrow_mut();
            archive.finalize_before(sync_time)?;
            archive.flush()?;
        }

        // Create or refresh state files, and fail now if they are not
        // writable.
        extractor.flush()?;

        let next_sync = sync_time.add_ms(SYNC_INTERVAL_MS);
        let mut until_flush = FLUSH_EVERY;
        let finished = loop {
            if extractor.fully_processed_timestamp() >= next_sync {
                break false;
            }
            if extractor.idle() && !opts.live {
                break true;
            }
            extractor.run()?;
            until_flush -= 1;
            if until_flush == 0 {
                extractor.flush()?;
                until_flush = FLUSH_EVERY;
            }
        };

        if finished {
            if opts.terminate {
                extractor.dispatcher.terminate()?;
                extractor.flush()?;
                drop(extractor);
                drop(parent_archive);
                let mut archive =
                    Archive::open(&opts.output_dir, FinalizeMode::Worker { exe })?;
                archive.terminate()?;
                archive.flush()?;
            } else {
                extractor.flush()?;
            }
            return Ok(());
        }
        extractor.flush()?;
    }
}
