//! xfprintd: fingerprint daemon owning the readers on the system bus.

mod auth;
mod bus;
mod config;
mod device;
mod driver;
mod error;
mod finger;
mod manager;
mod print;
mod storage;

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use log::{debug, info, warn, Level, LevelFilter, Log, Metadata, Record};
use zbus::Connection;

use crate::auth::{Gate, Polkit};
use crate::bus::{BusExporter, BusWatcher, ManagerIface};
use crate::config::Config;
use crate::driver::virt::VirtualContext;
use crate::manager::{
    LogindSeat, Manager, ManagerOptions, SeatService, MANAGER_PATH, SERVICE_NAME,
};

#[derive(Debug, Parser)]
#[command(name = "xfprintd", version, about = "Fingerprint handler daemon")]
struct Cli {
    /// Do not exit after unused for a while
    #[arg(short = 't', long)]
    no_timeout: bool,

    /// Make all warnings fatal
    #[arg(long = "g-fatal-warnings")]
    g_fatal_warnings: bool,
}

/// Wraps the logger so that `--g-fatal-warnings` turns any warning into an
/// abort, like the daemon it replaces.
struct FatalWarnings {
    inner: simple_logger::SimpleLogger,
}

impl Log for FatalWarnings {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.inner.log(record);
        if record.level() <= Level::Warn {
            std::process::abort();
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Stand-in seat service when logind is unreachable: no sleep events, no
/// inhibitors.
struct NoSeat;

#[async_trait]
impl SeatService for NoSeat {
    async fn take_sleep_inhibitor(&self) -> Option<Box<dyn Send>> {
        None
    }

    async fn next_sleep_event(&self) -> Option<bool> {
        std::future::pending().await
    }
}

fn init_logging(fatal_warnings: bool) {
    let logger = simple_logger::SimpleLogger::new().with_level(LevelFilter::Debug);
    if fatal_warnings {
        log::set_boxed_logger(Box::new(FatalWarnings { inner: logger }))
            .expect("logger installed twice");
        log::set_max_level(LevelFilter::Debug);
    } else {
        logger.init().expect("logger installed twice");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.g_fatal_warnings);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(()) => ExitCode::FAILURE,
    }
}

async fn run(cli: Cli) -> Result<(), ()> {
    // Obtain a connection to the system bus.
    let conn = match Connection::system().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!("Failed to open connection to bus: {err}");
            return Err(());
        }
    };

    // Load the configuration file and the storage backend it names.
    let config = Config::load(Path::new(config::CONFIG_PATH));
    let store = storage::from_config(&config);

    let ctx = match VirtualContext::from_env() {
        Ok(ctx) => Arc::new(ctx),
        Err(err) => {
            warn!("Failed to set up the reader backend: {err}");
            return Err(());
        }
    };

    let gate = Arc::new(Gate::new(Arc::new(Polkit::new(conn.clone()))));
    let watcher = Arc::new(BusWatcher::new(conn.clone()));
    let exporter = Arc::new(BusExporter::new(conn.clone(), Arc::clone(&gate)));

    let seat: Arc<dyn SeatService> = match LogindSeat::new(&conn).await {
        Ok(seat) => Arc::new(seat),
        Err(err) => {
            warn!("Cannot talk to the seat service, sleep handling disabled: {err}");
            Arc::new(NoSeat)
        }
    };

    debug!("Launching the manager");

    // One manager shared between all clients; this blocks until every
    // present reader has been enumerated.
    let manager = Manager::new(
        ctx,
        store,
        watcher,
        seat,
        exporter,
        ManagerOptions {
            no_timeout: cli.no_timeout,
            ..ManagerOptions::default()
        },
    )
    .await;

    if let Err(err) = conn
        .object_server()
        .at(MANAGER_PATH, ManagerIface::new(Arc::clone(&manager)))
        .await
    {
        warn!("Failed to export the manager object: {err}");
        return Err(());
    }

    // Request the well-known name only after the manager is up, so a
    // client enumerating right away sees every device.
    if let Err(err) = conn.request_name(SERVICE_NAME).await {
        warn!("Failed to get name: {err}");
        return Err(());
    }
    debug!("D-Bus service launched with name: {SERVICE_NAME}");

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(signal) => signal,
        Err(err) => {
            warn!("Failed to install the SIGTERM handler: {err}");
            return Err(());
        }
    };

    debug!("entering main loop");
    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, exiting"),
        _ = tokio::signal::ctrl_c() => info!("interrupted, exiting"),
    }
    debug!("main loop completed");

    Ok(())
}
