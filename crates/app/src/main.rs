use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use clap::Parser;
use directories::ProjectDirs;
use folio_application::{NavigationEngine, TocModel, TocNode};
use folio_core::{BookFile, BookId, ViewMode};
use folio_engine::AdapterRegistry;
use folio_storage::Storage;
use folio_ui::Ui;
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

#[derive(Debug, Parser)]
#[command(name = "folio")]
#[command(version, about = "Terminal e-book reader", long_about = None)]
#[command(after_help = "VIEW MODES:
    paginated, scrolled, simulation, successive")]
struct Args {
    /// Book to open (EPUB, PDF, MOBI or Markdown)
    #[arg(value_name = "PATH")]
    path: PathBuf,

    /// Declared MIME type; overrides the file extension
    #[arg(long, value_name = "TYPE")]
    mime: Option<String>,

    /// Progress key; defaults to a hash of the file content
    #[arg(long, value_name = "ID")]
    book_id: Option<String>,

    /// View mode to switch to and remember
    #[arg(long, value_name = "VIEW", value_parser = parse_view_mode)]
    mode: Option<ViewMode>,

    /// Print metadata and the table of contents as JSON, then exit
    #[arg(long)]
    info: bool,
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("dev", "folio", "folio").context("resolve project dirs")?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create config dir {}", config_dir.display()))?;
    init_logging(project_dirs.data_dir())?;

    let mut file = BookFile::read(&args.path)
        .with_context(|| format!("read {}", args.path.display()))?;
    if let Some(mime) = &args.mime {
        file = file.with_mime_type(mime.clone());
    }
    let book_id = args
        .book_id
        .clone()
        .map(BookId)
        .unwrap_or_else(|| BookId::from_bytes(&file.bytes));

    let registry = AdapterRegistry::with_defaults();
    if args.info {
        return print_info(&registry, &file);
    }

    let storage = Arc::new(Storage::open(config_dir.join("folio.db"))?);
    let mut settings = storage.load_settings()?;
    if let Some(mode) = args.mode {
        settings.set_view_mode(mode);
        storage.save_settings(&settings)?;
    }

    info!(file = %file.name, book_id = %book_id, mode = %settings.view_mode(), "starting reader");
    let mut engine = NavigationEngine::new(storage.clone(), settings);
    engine
        .open(&registry, &file, book_id)
        .with_context(|| format!("open {}", args.path.display()))?;

    let outcome = Ui::new(engine).run()?;
    storage.save_settings(&outcome.settings)?;
    Ok(())
}

fn parse_view_mode(value: &str) -> Result<ViewMode, String> {
    value.parse::<ViewMode>().map_err(|err| format!("{err}: {value}"))
}

/// The terminal belongs to the UI, so logs go to a file.
fn init_logging(data_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir {}", data_dir.display()))?;
    let log_path = data_dir.join("folio.log");
    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("open log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_env("FOLIO_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .try_init()
        .map_err(|err| anyhow::anyhow!("install tracing subscriber: {err}"))
}

fn print_info(registry: &AdapterRegistry, file: &BookFile) -> anyhow::Result<()> {
    let mut handle = registry.open(file)?;
    let toc = TocModel::build(&handle.outline(), handle.href_match());
    let cover = handle.cover().map(|cover| {
        json!({
            "media_type": cover.media_type,
            "bytes": cover.bytes.len(),
        })
    });

    let report = json!({
        "file": file.name,
        "format": handle.format().as_str(),
        "metadata": handle.metadata(),
        "locations": handle.location_count(),
        "cover": cover,
        "toc": toc.nodes().iter().map(toc_json).collect::<Vec<_>>(),
    });
    handle.close();
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn toc_json(node: &TocNode) -> serde_json::Value {
    json!({
        "id": node.id,
        "label": node.label,
        "href": node.href,
        "level": node.level,
        "children": node.children.iter().map(toc_json).collect::<Vec<_>>(),
    })
}
