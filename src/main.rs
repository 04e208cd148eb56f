//! floorplan - headless floor-plan dashboard for a home-automation hub
//!
//! Keeps the widget layout (local cache or shared cloud store), tracks live
//! entity state and runs widget actions. The diagram surface talks to
//! `floorplan serve` over JSON lines; the other subcommands edit the layout
//! from a terminal.

mod catalog;
mod config;
mod core;
mod data;
mod dispatcher;
mod hub;
mod icons;
mod notify;
mod persistence;
mod store;

use anyhow::{bail, Context, Result};
use clap::{Parser as ClapParser, Subcommand};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::catalog::{Category, EntityCatalog};
use crate::config::Config;
use crate::core::{AppCore, RenderUpdate, SurfaceEvent};
use crate::data::{Patch, WidgetPatch};
use crate::hub::{HubApi, HubClient, HubSocket};
use crate::notify::ToastKind;
use crate::persistence::{LocalBackend, LocalCache};

#[derive(ClapParser)]
#[command(name = "floorplan")]
#[command(about = "Headless floor-plan dashboard for Home Assistant", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Custom data directory (default: ~/.floorplan)
    /// Can also be set via FLOORPLAN_DIR environment variable
    #[arg(long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the surface protocol on stdin/stdout (default)
    Serve,
    /// List placed widgets
    List,
    /// List hub entities available for placement
    Entities {
        /// Only this category (sensors, doors, cameras, lights, switches)
        #[arg(short, long)]
        category: Option<Category>,
        /// Filter on entity id or friendly name
        #[arg(value_name = "QUERY", default_value = "")]
        query: String,
    },
    /// List hub services
    Services,
    /// Place an entity on the floor plan
    Place {
        entity: String,
        x: f64,
        y: f64,
        /// Widget size (default: template size)
        #[arg(long, num_args = 2, value_names = ["W", "H"])]
        size: Option<Vec<f64>>,
    },
    /// Remove a widget
    Remove { id: String },
    /// Run a widget's tap action
    Tap { id: String },
    /// Run a widget's hold action
    Hold { id: String },
    /// Change a widget's display overrides (empty value clears)
    Set {
        id: String,
        #[arg(long)]
        label: Option<String>,
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        suffix: Option<String>,
        #[arg(long)]
        icon: Option<String>,
    },
    /// Validate configuration and the local cache
    Validate,
}

impl Commands {
    fn needs_token(&self) -> bool {
        !matches!(self, Commands::Validate | Commands::List | Commands::Serve)
    }
}

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Set custom data directory if specified (before anything resolves paths)
    if let Some(data_dir) = &cli.data_dir {
        std::env::set_var(config::DIR_ENV, data_dir);
    }
    let base_dir = Config::base_dir()?;
    std::fs::create_dir_all(&base_dir)
        .context(format!("Failed to create data directory: {:?}", base_dir))?;

    // Initialize logging to file (use RUST_LOG env var to control level, e.g. RUST_LOG=debug)
    // stdout carries the surface protocol, so logs go to a file
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(Config::log_path()?)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::sync::Mutex::new(log_file))
        .with_ansi(false) // No color codes in log file
        .init();
    tracing::info!("Using data directory {:?}", base_dir);

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        let mut config = Config::load_from_path(config_path)?;
        config.apply_env_fallbacks(|key| std::env::var(key).ok());
        config
    } else {
        Config::load()?
    };

    let command = cli.command.unwrap_or(Commands::Serve);
    if let Commands::Validate = command {
        return validate(&config);
    }
    if command.needs_token() && std::io::stdin().is_terminal() {
        config.prompt_token()?;
    }

    // Use tokio runtime for async hub/cloud I/O
    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async_run(config, command));
    // The hub socket and stdin reader sit on blocking threads
    runtime.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn async_run(config: Config, command: Commands) -> Result<()> {
    let hub: Arc<dyn HubApi> = Arc::new(HubClient::new(
        &config.hub.address,
        &config.hub.access_token,
        config.request_timeout(),
    )?);

    match command {
        Commands::Serve => serve(config, hub).await,
        Commands::Entities { category, query } => {
            let states = hub.get_states().await.context("Failed to fetch entity states")?;
            let catalog = EntityCatalog::from_states(&states);
            let hits = catalog.search(category, &query);
            for entity in &hits {
                println!(
                    "{:<40} {:<8} {:<12} {}",
                    entity.entity_id, entity.category, entity.state, entity.friendly_name
                );
            }
            println!("{} of {} entities", hits.len(), catalog.len());
            Ok(())
        }
        Commands::Services => {
            let domains = hub.get_services().await.context("Failed to fetch services")?;
            for entry in crate::hub::flatten_services(&domains) {
                println!("{:<40} {}", entry.service, entry.label);
            }
            Ok(())
        }
        Commands::List => {
            let mut app = open_app(config, hub).await?;
            print_updates(&app.load().await, false);
            for id in app.store.widgets().keys() {
                let Some(view) = app.widget_view(id) else {
                    continue;
                };
                let position = view
                    .position
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<40} at {:<12} size {:<10} {}{}",
                    view.id,
                    position,
                    view.size.to_string(),
                    view.value.unwrap_or_default(),
                    if view.unknown { " (unknown entity)" } else { "" }
                );
            }
            println!("{} widgets ({} storage)", app.store.len(), app.store.backend_kind());
            Ok(())
        }
        Commands::Place { entity, x, y, size } => {
            let (width, height) = match size.as_deref() {
                Some([w, h]) => (Some(*w), Some(*h)),
                _ => (None, None),
            };
            let event = SurfaceEvent::Dropped {
                entity_id: entity.clone(),
                x,
                y,
                width,
                height,
            };
            run_events(config, hub, vec![event]).await?;
            println!("✓ Placed {}", entity);
            Ok(())
        }
        Commands::Remove { id } => {
            let updates = run_events(config, hub, vec![SurfaceEvent::Removed { id: id.clone() }]).await?;
            if !updates.iter().any(|u| matches!(u, RenderUpdate::WidgetRemoved { .. })) {
                eprintln!("✗ No widget {}", id);
                std::process::exit(1);
            }
            println!("✓ Removed {}", id);
            Ok(())
        }
        Commands::Tap { id } => {
            run_events(config, hub, vec![SurfaceEvent::Tap { id }]).await?;
            Ok(())
        }
        Commands::Hold { id } => {
            run_events(config, hub, vec![SurfaceEvent::Hold { id }]).await?;
            Ok(())
        }
        Commands::Set {
            id,
            label,
            prefix,
            suffix,
            icon,
        } => {
            let patch = WidgetPatch {
                label_name: label.map_or(Patch::Keep, Patch::Set),
                value_prefix: prefix.map_or(Patch::Keep, Patch::Set),
                value_suffix: suffix.map_or(Patch::Keep, Patch::Set),
                icon: icon.map_or(Patch::Keep, Patch::Set),
                ..WidgetPatch::default()
            };
            if patch.is_empty() {
                bail!("Nothing to set; pass --label, --prefix, --suffix or --icon");
            }
            run_events(config, hub, vec![SurfaceEvent::Edit { id: id.clone(), patch }]).await?;
            println!("✓ Updated {}", id);
            Ok(())
        }
        Commands::Validate => validate(&config),
    }
}

/// Build the app against the configured storage
async fn open_app(config: Config, hub: Arc<dyn HubApi>) -> Result<AppCore> {
    let cache_path = config.cache_path()?;
    let cache = match LocalCache::load(&cache_path) {
        Ok(cache) => cache,
        Err(e) => {
            tracing::warn!("Local cache unusable, keeping changes in memory: {:#}", e);
            LocalCache::in_memory()
        }
    };
    let local = Arc::new(LocalBackend::new(cache));
    let selection = persistence::select_backend(&config, local).await;
    Ok(AppCore::new(config, hub, selection))
}

/// Load, apply surface events as if the surface sent them, flush
async fn run_events(config: Config, hub: Arc<dyn HubApi>, events: Vec<SurfaceEvent>) -> Result<Vec<RenderUpdate>> {
    let mut app = open_app(config, hub).await?;
    print_updates(&app.load().await, false);

    let mut updates = Vec::new();
    for event in events {
        if let Some(id) = event.widget_id() {
            let placing = matches!(event, SurfaceEvent::Dropped { .. });
            if !placing && app.store.get(id).is_none() && !matches!(event, SurfaceEvent::Removed { .. }) {
                bail!("No widget {}", id);
            }
        }
        updates.extend(app.handle_surface_event(event, Instant::now()).await);
    }
    updates.extend(app.shutdown().await);
    print_updates(&updates, true);
    Ok(updates)
}

/// Terminal rendering of toasts and navigation
fn print_updates(updates: &[RenderUpdate], show_urls: bool) {
    for update in updates {
        match update {
            RenderUpdate::Toast(toast) => match toast.kind {
                ToastKind::Error => eprintln!("✗ {}", toast.message),
                ToastKind::Warning => eprintln!("⚠ {}", toast.message),
                ToastKind::Success | ToastKind::Info => println!("✓ {}", toast.message),
            },
            RenderUpdate::OpenUrl { url } if show_urls => println!("Open {}", url),
            _ => {}
        }
    }
}

/// `floorplan serve`: surface protocol on stdin/stdout plus the live feed
async fn serve(config: Config, hub: Arc<dyn HubApi>) -> Result<()> {
    use tokio::sync::mpsc;

    let address = config.hub.address.clone();
    let token = config.hub.access_token.clone();
    let mut app = open_app(config, hub).await?;

    let mut stdout = tokio::io::stdout();
    let updates = app.load().await;
    crate::core::write_updates(&mut stdout, &updates).await?;

    let hub_events = if token.trim().is_empty() {
        tracing::warn!("No hub access token; live updates off, polling states");
        None
    } else {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _socket = HubSocket::spawn(address, token, event_tx);
        Some(event_rx)
    };

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    app.run(stdin, &mut stdout, hub_events).await?;
    tracing::info!("Surface closed, exiting");
    Ok(())
}

fn validate(config: &Config) -> Result<()> {
    println!("Validating configuration");
    let mut errors = 0;

    for issue in config.validate() {
        eprintln!("✗ Error: {}", issue);
        errors += 1;
    }

    let cache_path = config.cache_path()?;
    match LocalCache::load(&cache_path) {
        Ok(cache) => {
            let widgets = cache.get_json::<Vec<String>>(persistence::local::KEY_ENTITIES).unwrap_or_default();
            println!("✓ Local cache {:?} readable ({} widgets)", cache_path, widgets.len());
        }
        Err(e) => {
            eprintln!("✗ Error: local cache {:?}: {:#}", cache_path, e);
            errors += 1;
        }
    }

    if errors > 0 {
        eprintln!("\n✗ Found {} error(s)", errors);
        std::process::exit(1);
    }
    println!("✓ Configuration is valid with no issues");
    Ok(())
}
