pub mod alert;
pub mod clock;
pub mod console;
pub mod errors;
pub mod events;
pub mod exam;
pub mod repository;
pub mod scheduler;
pub mod settings;
pub mod station;
pub mod store;
pub mod utils;

use std::path::PathBuf;

use clap::Parser;
use console::ConsoleOptions;
use events::EventBus;
use station::{Station, StationOptions};

#[derive(Debug, Parser)]
#[command(name = "piotrack", version, about = "Timed intraocular pressure exams")]
pub struct Cli {
    /// Where settings, the ownership ledger and the default database live.
    #[arg(long, env = "PIOTRACK_DATA_DIR", default_value = "piotrack-data")]
    pub data_dir: PathBuf,

    /// Keep exams in memory only.
    #[arg(long)]
    pub memory: bool,

    /// Never play the alert chime.
    #[arg(long)]
    pub no_sound: bool,

    /// Print events as JSON lines instead of text.
    #[arg(long)]
    pub json_events: bool,

    #[arg(long, env = "PIOTRACK_DEBUG")]
    pub debug: bool,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    utils::logging::init(cli.debug);

    log::info!("piotrack starting up...");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let (events, receiver) = EventBus::channel();
        let options = StationOptions {
            data_dir: cli.data_dir,
            memory: cli.memory,
            mute: cli.no_sound,
        };
        let station = Station::open(&options, events).await?;
        console::run(
            &station,
            receiver,
            ConsoleOptions {
                json_events: cli.json_events,
            },
        )
        .await
    })
}
