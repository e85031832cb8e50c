use anyhow::{bail, Context as _, Result};
use clap::Parser;
use rpiboot_rs::{
    Catalog, ConnectionManager, DirAssets, DisconnectStatus, RusbBackend, SessionEvent,
};
use rusb::Context;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "rpiboot", version)]
#[command(about = "Boot a Raspberry Pi over USB and serve the files it asks for")]
#[command(long_about = None)]
struct Args {
    /// TOML file with the model and gadget tables (built-in tables otherwise).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Directory gadget asset locations are relative to.
    #[arg(long, value_name = "DIR", default_value = ".")]
    assets: PathBuf,
    /// Gadget to boot the device into.
    #[arg(long, short)]
    gadget: Option<String>,
    /// List the gadgets the connected device can run and exit.
    #[arg(long)]
    list: bool,
    /// How long each hot-plug poll waits, in milliseconds.
    #[arg(long, value_name = "MS", default_value_t = 250)]
    wait_ms: u64,
    /// Log transfers and command frames.
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let catalog = match &args.config {
        Some(path) => Catalog::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Catalog::builtin(),
    };
    if let Some(id) = &args.gadget {
        if catalog.gadget(id).is_none() {
            bail!("unknown gadget {}", id);
        }
    }

    let ctx = Context::new().context("could not initialize libusb")?;
    if !RusbBackend::<Context>::supports_hotplug() {
        warn!("libusb has no hotplug support on this platform");
    }
    let backend = RusbBackend::new(ctx, catalog.vendor_id);
    let mut manager = ConnectionManager::new(backend, DirAssets::new(&args.assets), catalog);

    let (tx, rx) = mpsc::channel();
    manager.subscribe(move |event: &SessionEvent| {
        let _ = tx.send(event.clone());
    })?;

    manager.discover()?;

    let wait = Duration::from_millis(args.wait_ms);
    info!("waiting for a device");
    while manager.session().attached().is_none() {
        manager.poll(wait)?;
    }

    for event in rx.try_iter() {
        if let SessionEvent::Connected {
            model,
            serial_number,
        } = event
        {
            info!(
                "connected to {} ({}), serial {}",
                model.name,
                model.chipset,
                serial_number.as_deref().unwrap_or("unknown")
            );
        }
    }

    let available = manager.available_gadgets()?;
    if args.list || args.gadget.is_none() {
        if available.is_empty() {
            println!("no gadgets available for this device");
        }
        for id in &available {
            let name = manager
                .catalog()
                .gadget(id)
                .map(|g| g.name.as_str())
                .unwrap_or_default();
            println!("{:<20} {}", id, name);
        }
        manager.deinit();
        return Ok(());
    }

    let gadget = args.gadget.as_deref().unwrap_or_default();
    manager
        .start_gadget(gadget)
        .with_context(|| format!("failed to start {}", gadget))?;

    let status = loop {
        if let Some(SessionEvent::Disconnected(status)) = rx
            .try_iter()
            .find(|e| matches!(e, SessionEvent::Disconnected(_)))
        {
            break status;
        }
        manager.poll(wait)?;
    };

    manager.deinit();
    match status {
        DisconnectStatus::Success => {
            info!("{} booted", gadget);
            Ok(())
        }
        other => bail!("device disconnected before finishing ({:?})", other),
    }
}
