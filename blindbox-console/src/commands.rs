use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};

use blindbox_core::{export_csv, export_file_name, ExportOptions, Snapshot};
use blindbox_sync::{
    CatalogSource, ClaimArbiter, RelayServer, RelayServerConfig, SessionStore, TransportConfig,
};

use crate::render;

/// A store over the configured backend.
pub struct Context {
    store: SessionStore,
}

impl Context {
    pub fn new(config: TransportConfig, catalog: Arc<dyn CatalogSource>) -> Self {
        let transport = config.connect();
        log::debug!("Using {}", transport.describe());
        Self {
            store: SessionStore::with_defaults(transport, catalog),
        }
    }

    /// Pull the current session, or fail if the backend has none.
    async fn current(&self) -> Result<Snapshot> {
        self.store.refresh().await;
        match self.store.snapshot() {
            Some(snapshot) => Ok(snapshot),
            None => bail!(
                "no session found on {}; run `blindbox teacher init` first",
                self.store.transport().describe()
            ),
        }
    }

    fn print_status(&self) {
        if let Some(snapshot) = self.store.snapshot() {
            print!("{}", render::status_report(&snapshot));
        }
    }
}

pub async fn relay(bind: String, max_subscribers: usize) -> Result<()> {
    let server = RelayServer::new(RelayServerConfig {
        bind_addr: bind,
        max_subscribers_per_room: max_subscribers,
        ..RelayServerConfig::default()
    });
    tokio::select! {
        served = server.run() => served.map_err(|e| anyhow!(e))?,
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            server.shutdown();
            log::info!("Relay stopped");
        }
    }
    Ok(())
}

pub async fn initialize(ctx: &Context) -> Result<()> {
    ctx.store.initialize().await?;
    println!("Initialized with {} boxes", ctx.store.catalog().len());
    Ok(())
}

pub async fn start(ctx: &Context) -> Result<()> {
    ctx.store.start_session().await?;
    ctx.print_status();
    Ok(())
}

pub async fn end(ctx: &Context) -> Result<()> {
    ctx.store.end_session().await?;
    ctx.print_status();
    Ok(())
}

pub async fn reset(ctx: &Context, refetch: bool) -> Result<()> {
    ctx.store.reset_session(refetch).await?;
    ctx.print_status();
    Ok(())
}

pub async fn status(ctx: &Context) -> Result<()> {
    let snapshot = ctx.current().await?;
    print!("{}", render::status_report(&snapshot));
    Ok(())
}

pub async fn clear(ctx: &Context) {
    ctx.store.clear_remote().await;
    println!("Cleared");
}

pub async fn export(
    ctx: &Context,
    out: Option<PathBuf>,
    symbol_header: String,
    claimant_header: String,
) -> Result<()> {
    let snapshot = ctx.current().await?;
    let options = ExportOptions {
        symbol_header,
        claimant_header,
    };
    let path = out.unwrap_or_else(|| {
        let today = chrono::Local::now().format("%Y-%m-%d").to_string();
        PathBuf::from(export_file_name(&today))
    });

    tokio::fs::write(&path, export_csv(&snapshot, &options)).await?;
    let (claimed, _) = snapshot.progress();
    println!("Wrote {claimed} rows to {}", path.display());
    Ok(())
}

pub async fn boxes(ctx: &Context, name: &str) -> Result<()> {
    let snapshot = ctx.current().await?;
    println!("{}", snapshot.phase());
    print!("{}", render::box_grid(&snapshot, name));
    Ok(())
}

pub async fn claim(ctx: &Context, token: &str, name: &str) -> Result<()> {
    let snapshot = ctx.current().await?;
    let entry = match render::resolve_box(&snapshot, token) {
        Some(entry) => entry.clone(),
        None => bail!("no box {token}"),
    };

    let arbiter = ClaimArbiter::new(ctx.store.clone());
    arbiter.claim(&entry.id, name).await?;
    print!("{}", render::revealed_card(&entry, name));
    Ok(())
}

pub async fn mine(ctx: &Context, name: &str) -> Result<()> {
    let snapshot = ctx.current().await?;
    match snapshot.entry_of(name).and_then(|id| snapshot.entry(id)) {
        Some(entry) => print!("{}", render::revealed_card(entry, name)),
        None => println!("{name} has not opened a box yet"),
    }
    Ok(())
}

pub async fn watch(ctx: &Context) -> Result<()> {
    let _listener = ctx
        .store
        .on_change(|snapshot| println!("{}", render::change_line(snapshot)));
    let attachment = ctx.store.attach().await;
    log::info!("Watching ({:?}); Ctrl-C to stop", attachment.mode());

    tokio::signal::ctrl_c().await?;
    Ok(())
}
