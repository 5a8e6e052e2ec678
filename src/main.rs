use std::io::IsTerminal;
use std::path::PathBuf;

use argh::FromArgs;
use exitcode::ExitCode;
use harvestd::config::Config;
use harvestd::parser::LineParserFactory;
use harvestd::sink::WriterSink;
use harvestd::state::JsonFileStore;
use harvestd::{Coordinator, trace};
use tracing::{error, info};

fn default_worker_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

#[derive(FromArgs)]
#[argh(
    description = "Harvestd ingests instrument data files, resuming where it left off",
    help_triggers("-h", "--help")
)]
struct RootCommand {
    #[argh(
        option,
        short = 'c',
        long = "config",
        description = "path of the YAML configuration"
    )]
    config: PathBuf,

    #[argh(
        option,
        short = 'l',
        default = "\"info\".to_string()",
        description = "log level, overridden by HARVESTD_LOG"
    )]
    log_level: String,

    #[argh(
        option,
        short = 't',
        default = "default_worker_threads()",
        description = "specify how many threads the Tokio runtime will use"
    )]
    threads: usize,

    #[argh(switch, description = "emit logs as JSON")]
    json_logs: bool,
}

impl RootCommand {
    fn run(&self) -> Result<(), ExitCode> {
        let levels = std::env::var("HARVESTD_LOG").unwrap_or_else(|_| {
            match self.log_level.as_str() {
                "off" => "off".to_owned(),
                level => format!("harvestd={level},harvest={level}"),
            }
        });
        let color = std::io::stderr().is_terminal();
        trace::init(color, self.json_logs, &levels);

        let config = Config::load(&self.config).map_err(|err| {
            error!(message = "Load configuration failed", %err);
            exitcode::CONFIG
        })?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .thread_name("harvestd-worker")
            .worker_threads(self.threads.max(1))
            .enable_io()
            .enable_time()
            .build()
            .map_err(|err| {
                error!(message = "Build runtime failed", %err);
                exitcode::OSERR
            })?;

        runtime.block_on(async move {
            info!(
                message = "Start harvestd",
                threads = self.threads,
                config = ?self.config,
                data_dir = ?config.data_dir
            );

            let store = JsonFileStore::new(&config.data_dir);
            let sink = WriterSink::new(std::io::stdout());
            let mut coordinator: Coordinator<LineParserFactory, _> =
                Coordinator::new(config.supported_keys(), store, sink).map_err(|err| {
                    error!(message = "Load state failed", %err);
                    exitcode::DATAERR
                })?;

            for (key, source) in config.sources {
                coordinator
                    .add_source(key, source.harvester, LineParserFactory::new(source.chunk_size))
                    .map_err(|err| {
                        error!(message = "Invalid data source", %err);
                        exitcode::CONFIG
                    })?;
            }

            // listening before sampling, so an early interrupt is not lost
            let signal = tokio::spawn(tokio::signal::ctrl_c());

            coordinator.start_sampling().map_err(|err| {
                error!(message = "Start sampling failed", %err);
                exitcode::SOFTWARE
            })?;

            match signal.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(message = "Listen for shutdown signal failed", %err),
                Err(err) => error!(message = "Shutdown signal task failed", %err),
            }

            info!(message = "Shutdown signal received");
            coordinator.stop_sampling().await;

            Ok::<(), ExitCode>(())
        })
    }
}

fn main() {
    let opts: RootCommand = argh::from_env();

    if let Err(code) = opts.run() {
        std::process::exit(code);
    }
}
