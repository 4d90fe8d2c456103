//! Command-line surface over the core engine.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};
use wselector_core::apply::{ApplyRequest, CommandBackend, DesktopEnv, WallpaperApplier};
use wselector_core::cache::{DEFAULT_SAMPLE_INTERVAL, PressureMonitor, SystemMemory};
use wselector_core::catalog::WallhavenClient;
use wselector_core::download::{DownloadEvent, TaskHandle};
use wselector_core::feed::{FeedConfig, FeedIntent, MergeOutcome};
use wselector_core::log::{LogConfig, LogLevel};
use wselector_core::net::Transport;
use wselector_core::store::{AssetStore, Settings, SettingsStore};
use wselector_core::{
    AssetKey, CatalogEntry, Category, Engine, EngineConfig, EngineUpdate, EntryId, Filters, Purity,
    Query, SortOrder,
};

use crate::http::{REQUEST_TIMEOUT, ReqwestTransport};

/// Upper bound for one page to arrive, retries of the transport included.
const FEED_WAIT: Duration = Duration::from_secs(60);
const DOWNLOAD_WAIT: Duration = Duration::from_secs(600);
const PUMP_SLICE: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "wselector", version, about = "Browse Wallhaven and set wallpapers")]
pub struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true, env = "WSELECTOR_SETTINGS", value_name = "PATH")]
    settings: Option<PathBuf>,

    /// Log debug output to the console.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search the catalog and remember the query for later commands.
    Search {
        /// Free-text search; omit to browse.
        #[arg(value_name = "TEXT")]
        text: Option<String>,

        #[arg(long, value_enum)]
        sort: Option<SortArg>,

        /// Restrict to these categories (repeatable).
        #[arg(long = "category", value_enum)]
        categories: Vec<CategoryArg>,

        /// Allowed purity levels (repeatable).
        #[arg(long, value_enum)]
        purity: Vec<PurityArg>,

        /// Number of pages to load.
        #[arg(long, default_value_t = 1)]
        pages: u32,

        /// Print entries as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Download wallpapers from the last search.
    Download {
        #[arg(value_name = "ID", required = true)]
        ids: Vec<String>,

        /// Pages of the last search to look through.
        #[arg(long, default_value_t = 3)]
        pages: u32,
    },

    /// Set a wallpaper from the last search, or a local file, as the desktop background.
    #[command(after_long_help = r#"Examples:
  wselector apply l8rw5y                       # Download if needed, then apply everywhere
  wselector apply l8rw5y --monitor DP-1        # Only on DP-1 (Hyprland, wlroots)
  wselector apply --file ~/Pictures/wall.png   # Apply a local file"#)]
    Apply {
        #[arg(value_name = "ID", required_unless_present = "file", conflicts_with = "file")]
        id: Option<String>,

        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Target monitor (repeatable); all monitors when omitted.
        #[arg(long = "monitor", value_name = "NAME")]
        monitors: Vec<String>,

        /// Drive this desktop instead of the detected or configured one.
        #[arg(long, value_enum)]
        desktop: Option<DesktopArg>,

        #[arg(long, default_value_t = 3)]
        pages: u32,
    },

    /// Show the detected desktop, storage locations, and the remembered query.
    Status,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum SortArg {
    Latest,
    Popular,
    Random,
    Views,
    Favorites,
}

impl From<SortArg> for SortOrder {
    fn from(arg: SortArg) -> Self {
        match arg {
            SortArg::Latest => SortOrder::Latest,
            SortArg::Popular => SortOrder::Popular,
            SortArg::Random => SortOrder::Random,
            SortArg::Views => SortOrder::Views,
            SortArg::Favorites => SortOrder::Favorites,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum CategoryArg {
    General,
    Anime,
    People,
}

impl From<CategoryArg> for Category {
    fn from(arg: CategoryArg) -> Self {
        match arg {
            CategoryArg::General => Category::General,
            CategoryArg::Anime => Category::Anime,
            CategoryArg::People => Category::People,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum PurityArg {
    Sfw,
    Sketchy,
}

impl From<PurityArg> for Purity {
    fn from(arg: PurityArg) -> Self {
        match arg {
            PurityArg::Sfw => Purity::Sfw,
            PurityArg::Sketchy => Purity::Sketchy,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DesktopArg {
    Portal,
    Gnome,
    Cinnamon,
    Mate,
    Kde,
    Xfce,
    Hyprland,
    Wlroots,
}

impl From<DesktopArg> for DesktopEnv {
    fn from(arg: DesktopArg) -> Self {
        match arg {
            DesktopArg::Portal => DesktopEnv::Portal,
            DesktopArg::Gnome => DesktopEnv::Gnome,
            DesktopArg::Cinnamon => DesktopEnv::Cinnamon,
            DesktopArg::Mate => DesktopEnv::Mate,
            DesktopArg::Kde => DesktopEnv::Kde,
            DesktopArg::Xfce => DesktopEnv::Xfce,
            DesktopArg::Hyprland => DesktopEnv::Hyprland,
            DesktopArg::Wlroots => DesktopEnv::Wlroots,
        }
    }
}

impl Cli {
    pub fn execute(self) -> anyhow::Result<()> {
        let level = if self.verbose { LogLevel::DEBUG } else { LogConfig::default().console_level };
        if let Err(err) = wselector_core::log::init(LogConfig::default().with_console_level(level)) {
            eprintln!("wselector: failed to initialise logging: {err:#}");
        }

        let mut session = Session::open(self.settings)?;
        let result = match self.command {
            Commands::Search { text, sort, categories, purity, pages, json } => {
                let query = search_query(session.settings.last_query.clone(), text, sort, categories, purity);
                session.search(query, pages, json)
            }
            Commands::Download { ids, pages } => session.download(&ids, pages),
            Commands::Apply { id, file, monitors, desktop, pages } => {
                session.apply(id, file, monitors, desktop.map(DesktopEnv::from), pages)
            }
            Commands::Status => session.status(),
        };
        session.close();
        result
    }
}

/// Overlay command-line choices on the remembered query.
fn search_query(
    mut query: Query,
    text: Option<String>,
    sort: Option<SortArg>,
    categories: Vec<CategoryArg>,
    purity: Vec<PurityArg>,
) -> Query {
    if let Some(text) = text {
        query.search = text;
    }
    if let Some(sort) = sort {
        query.sort = sort.into();
    }
    if !categories.is_empty() {
        query.filters.categories = categories.into_iter().map(Category::from).collect();
    }
    if !purity.is_empty() {
        query.filters.purity = purity.into_iter().map(Purity::from).collect::<BTreeSet<_>>();
    }
    if query.filters.categories.is_empty() || query.filters.purity.is_empty() {
        query.filters = Filters::default();
    }
    query.with_page(1)
}

/// Engine plus the settings it was built from. Saved again on close.
struct Session {
    store: SettingsStore,
    settings: Settings,
    engine: Engine,
    _pressure: Option<PressureMonitor>,
}

impl Session {
    fn open(settings_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let store = match settings_path {
            Some(path) => SettingsStore::at(path),
            None => SettingsStore::default_location()?,
        };
        let settings = store.load()?;
        debug!(path = %store.path().display(), "settings loaded");

        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(REQUEST_TIMEOUT)?);
        let catalog =
            Arc::new(WallhavenClient::new(Arc::clone(&transport)).with_api_key(settings.api_key.clone()));
        let root = settings.asset_root()?;
        let assets = AssetStore::open(&root)
            .with_context(|| format!("opening asset store at {}", root.display()))?;
        let backend = Arc::new(CommandBackend::system(settings.apply_timeout()));
        let applier = WallpaperApplier::new(backend).with_override(settings.desktop_override.clone());

        let mut engine =
            Engine::new(EngineConfig::from_settings(&settings), catalog, transport, assets, applier)?;
        engine.restore_query(settings.last_query.clone(), FeedConfig { debounce: settings.debounce() });

        let pressure = match engine.monitor_pressure(SystemMemory::new(), DEFAULT_SAMPLE_INTERVAL) {
            Ok(monitor) => Some(monitor),
            Err(err) => {
                warn!(error = %err, "memory pressure monitoring unavailable");
                None
            }
        };

        Ok(Self { store, settings, engine, _pressure: pressure })
    }

    fn close(mut self) {
        self.settings.last_query = self.engine.feed().query().with_page(1);
        if let Err(err) = self.store.save(&self.settings) {
            warn!(error = %format!("{err:#}"), "failed to save settings");
        }
    }

    fn search(&mut self, query: Query, pages: u32, json: bool) -> anyhow::Result<()> {
        self.engine.restore_query(query, FeedConfig { debounce: self.settings.debounce() });
        self.load_pages(pages)?;

        let entries = self.engine.feed().entries();
        if json {
            println!("{}", serde_json::to_string_pretty(entries)?);
            return Ok(());
        }
        for entry in entries {
            println!(
                "{:<8} {:>5}x{:<5} {:>7} fav  {}",
                entry.id,
                entry.resolution.width,
                entry.resolution.height,
                entry.popularity.favorites,
                entry.full_url
            );
        }
        if entries.is_empty() {
            println!("no wallpapers match");
        } else if self.engine.feed().has_more() {
            println!("-- more available, rerun with --pages {}", pages.saturating_add(1));
        }
        Ok(())
    }

    fn download(&mut self, ids: &[String], pages: u32) -> anyhow::Result<()> {
        let entries = self.find_entries(ids, pages)?;
        let mut handles = Vec::with_capacity(entries.len());
        for entry in &entries {
            handles.push(self.engine.download(entry)?);
        }
        let failures = self.wait_for_downloads(handles)?;
        if failures > 0 {
            bail!("{failures} download(s) failed");
        }
        Ok(())
    }

    fn apply(
        &mut self,
        id: Option<String>,
        file: Option<PathBuf>,
        monitors: Vec<String>,
        desktop: Option<DesktopEnv>,
        pages: u32,
    ) -> anyhow::Result<()> {
        let applied = match (id, file) {
            (_, Some(file)) => {
                let request = ApplyRequest { environment: desktop, monitors, ..ApplyRequest::new(file) };
                self.engine.applier().apply(&request)?
            }
            (Some(id), None) => {
                let entry = self.find_entries(&[id], pages)?.remove(0);
                let key = AssetKey::full(&entry);
                if !self.engine.store().contains(&key) {
                    let handle = self.engine.download(&entry)?;
                    if self.wait_for_downloads(vec![handle])? > 0 {
                        bail!("could not download {}", entry.id);
                    }
                }
                let path = self.engine.store().path_for(&key);
                let request = ApplyRequest { environment: desktop, monitors, ..ApplyRequest::new(path) };
                self.engine.apply(&entry, request)?
            }
            (None, None) => bail!("either an ID or --file is required"),
        };
        println!("applied {} on {}", applied.path.display(), applied.environment);
        Ok(())
    }

    fn status(&mut self) -> anyhow::Result<()> {
        let environment = self.engine.applier().environment();
        let status = serde_json::json!({
            "version": wselector_core::version(),
            "settings": self.store.path(),
            "assets": self.engine.store().root(),
            "desktop": environment.to_string(),
            "desktop_supported": environment.is_supported(),
            "last_query": self.settings.last_query,
            "cache": self.engine.cache_stats(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        Ok(())
    }

    /// Reload page 1 of the active query, then follow pages up to `pages`.
    fn load_pages(&mut self, pages: u32) -> anyhow::Result<()> {
        self.engine.submit(FeedIntent::Reset, Instant::now());
        self.wait_for_page()?;
        while self.engine.feed().has_more() && self.engine.feed().query().page < pages {
            self.engine.submit(FeedIntent::RequestNextPage, Instant::now());
            self.wait_for_page()?;
        }
        info!(
            entries = self.engine.feed().entries().len(),
            page = self.engine.feed().query().page,
            "feed loaded"
        );
        Ok(())
    }

    fn wait_for_page(&mut self) -> anyhow::Result<()> {
        let deadline = Instant::now() + FEED_WAIT;
        while Instant::now() < deadline {
            for update in self.engine.pump(PUMP_SLICE) {
                match update {
                    EngineUpdate::FeedUpdated(MergeOutcome::Merged { added, duplicates, .. }) => {
                        debug!(added, duplicates, "page merged");
                        return Ok(());
                    }
                    EngineUpdate::FeedFailed(failure) => {
                        return Err(anyhow::Error::new(failure.error)
                            .context(format!("loading page {}", failure.query.page)));
                    }
                    _ => {}
                }
            }
        }
        bail!("no response from the catalog within {FEED_WAIT:?}")
    }

    /// Resolve ids against the remembered query, in the order given.
    fn find_entries(&mut self, ids: &[String], pages: u32) -> anyhow::Result<Vec<CatalogEntry>> {
        let wanted: Vec<EntryId> = ids.iter().map(|id| EntryId::new(id.trim())).collect();
        self.load_pages(pages)?;
        let entries = self.engine.feed().entries();
        wanted
            .iter()
            .map(|id| {
                entries.iter().find(|entry| &entry.id == id).cloned().ok_or_else(|| {
                    anyhow!("{id} is not in the first {pages} page(s) of the last search")
                })
            })
            .collect()
    }

    /// Pump until every handle reported. Returns the number of failures.
    fn wait_for_downloads(&mut self, mut handles: Vec<TaskHandle>) -> anyhow::Result<usize> {
        let deadline = Instant::now() + DOWNLOAD_WAIT;
        let mut failures = 0;
        while !handles.is_empty() {
            if Instant::now() >= deadline {
                bail!("{} download(s) still running after {DOWNLOAD_WAIT:?}", handles.len());
            }
            for update in self.engine.pump(PUMP_SLICE) {
                let EngineUpdate::DownloadFinished(event) = update else { continue };
                let Some(index) = handles.iter().position(|handle| handle == event.task()) else {
                    continue;
                };
                let handle = handles.swap_remove(index);
                match event {
                    DownloadEvent::Succeeded { path, attempts, .. } => {
                        println!("{} -> {} ({attempts} attempt(s))", handle.entry, path.display());
                    }
                    DownloadEvent::Failed { error, .. } => {
                        failures += 1;
                        eprintln!("{}: {error}", handle.entry);
                    }
                }
                self.engine.acknowledge(handle.id);
            }
        }
        Ok(failures)
    }
}
