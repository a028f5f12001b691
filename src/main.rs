// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use lectern::catalog::{Catalog, MemoryCatalog};
use lectern::config::Config;
use lectern::download::{DownloadQueue, DownloadWorker, HttpFetcher, JUMP_SEQUENCE};
use lectern::store::FileStore;
use lectern::types::{Book, BookId, Section, SectionKey};
use lectern::utils::{format_bytes, format_duration_ms, parse_duration_secs};

const VERSION: &str = env!("CARGO_PKG_VERSION");

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// Data error - unknown book or section
    pub const DATA_ERR: i32 = 65;
    /// Temporary failure - some sections could not be fetched
    pub const TEMP_FAIL: i32 = 75;
}

use exit_codes::*;

/// Spinner helpers for consistent progress indicators
#[derive(Parser)]
#[command(name = "lectern")]
#[command(version = VERSION)]
#[command(about = "Progressive audiobook downloads. Listen while sections download.")]
#[command(long_about = "lectern - progressive audiobook downloads\n\n\
    Add a book:          lectern add-book 1 --external-id 77 --title Walden\n\
    Add a section:       lectern add-section 1 --url http://host/walden_01.mp3 --size 4000000 --duration 12:30\n\
    Queue it:            lectern enqueue 1\n\
    Download:            lectern fetch\n\
    Inspect the queue:   lectern queue")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Catalog file (defaults to catalog.json next to the queue file)
    #[arg(long, global = true)]
    catalog: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log debug output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List books in the catalog
    Books,

    /// List the sections of a book with their download state
    ///
    /// Example:
    ///   lectern sections 1
    Sections {
        book: BookId,
    },

    /// Add (or replace) a book in the catalog
    AddBook {
        id: BookId,
        /// Identifier of the book at its source
        #[arg(long)]
        external_id: String,
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        author: String,
    },

    /// Append a section to a book
    ///
    /// Example:
    ///   lectern add-section 1 --url http://host/walden_01.mp3 --size 4000000 --duration 1:02:03
    AddSection {
        book: BookId,
        #[arg(long)]
        url: String,
        /// Expected file size in bytes
        #[arg(long)]
        size: u64,
        /// Duration as h:mm:ss, m:ss or seconds
        #[arg(long)]
        duration: String,
        #[arg(long, default_value = "")]
        title: String,
    },

    /// Queue sections for download
    ///
    /// Examples:
    ///   lectern enqueue 1
    ///   lectern enqueue 1 --section 4
    Enqueue {
        book: BookId,
        /// Queue only this section
        #[arg(short, long)]
        section: Option<u32>,
    },

    /// Show the download queue
    Queue,

    /// Remove a section from the download queue
    Cancel {
        book: BookId,
        section: u32,
    },

    /// Download everything in the queue
    Fetch,

    /// Delete a book's downloaded files and its queued requests
    Delete {
        book: BookId,
    },

    /// Show disk usage of the library
    Usage,

    /// Show the effective configuration
    Config,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "lectern=debug" } else { "lectern=warn" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn default_catalog_path(config: &Config) -> PathBuf {
    config.queue_file.with_file_name("catalog.json")
}

/// Load the catalog, starting empty when the file does not exist yet.
fn load_catalog(path: &Path) -> Result<MemoryCatalog> {
    if path.exists() {
        MemoryCatalog::load(path)
    } else {
        Ok(MemoryCatalog::new())
    }
}

fn save_catalog(catalog: &MemoryCatalog, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    catalog.save(path)
}

fn require_book(catalog: &MemoryCatalog, book_id: BookId) -> Book {
    match catalog.book(book_id) {
        Ok(book) => book,
        Err(e) => {
            eprintln!("{RED}[X]{RESET} {}", e);
            std::process::exit(DATA_ERR);
        }
    }
}

fn list_books(catalog: &MemoryCatalog, store: &FileStore) {
    let books = catalog.books();
    if books.is_empty() {
        println!("{DIM}No books in the catalog.{RESET}");
        return;
    }
    for book in books {
        let sections = catalog.sections(book.id);
        let total_ms: u64 = sections.iter().map(Section::duration_ms).sum();
        let on_disk = lectern::store::disk_usage(&store.book_dir(&book));
        println!(
            "{BOLD}{:>4}{RESET}  {} {DIM}{}{RESET}",
            book.id, book.title, book.author
        );
        println!(
            "      {} sections, {}, {} on disk, at section {} {}",
            book.num_sections,
            format_duration_ms(total_ms),
            format_bytes(on_disk),
            book.current_section,
            format_duration_ms(book.current_position_ms)
        );
    }
}

fn list_sections(catalog: &MemoryCatalog, store: &FileStore, book_id: BookId) {
    let book = require_book(catalog, book_id);
    println!("{BOLD}{}{RESET}", book.title);
    for section in catalog.sections(book_id) {
        let on_disk = store.length(&store.section_path(&book, &section));
        let state = if section.size_bytes > 0 && on_disk >= section.size_bytes {
            format!("{GREEN}complete{RESET}")
        } else if on_disk > 0 {
            format!(
                "{YELLOW}{} of {}{RESET}",
                format_bytes(on_disk),
                format_bytes(section.size_bytes)
            )
        } else {
            format!("{DIM}not downloaded{RESET}")
        };
        let marker = if section.section_number == book.current_section {
            ">"
        } else {
            " "
        };
        println!(
            "{} {:>3}  {:<32} {:>10}  {}",
            marker,
            section.section_number,
            section.title,
            format_duration_ms(section.duration_ms()),
            state
        );
    }
}

fn add_section(
    catalog: &MemoryCatalog,
    book_id: BookId,
    url: String,
    size: u64,
    duration: &str,
    title: String,
) -> Result<u32> {
    let mut book = require_book(catalog, book_id);
    let duration_secs = parse_duration_secs(duration)?;
    let mut sections = catalog.sections(book_id);
    let section_number = sections.len() as u32 + 1;
    let title = if title.is_empty() {
        format!("Section {}", section_number)
    } else {
        title
    };
    sections.push(Section {
        book_id,
        section_number,
        url,
        size_bytes: size,
        duration_secs,
        title,
        author: book.author.clone(),
    });
    book.num_sections = section_number;
    catalog.insert_book(book, sections);
    Ok(section_number)
}

fn enqueue(catalog: &MemoryCatalog, config: &Config, book_id: BookId, only: Option<u32>) -> Result<()> {
    let book = require_book(catalog, book_id);
    let sections: Vec<Section> = match only {
        Some(n) => match catalog.section(book.section_key(n)) {
            Ok(section) => vec![section],
            Err(e) => {
                eprintln!("{RED}[X]{RESET} {}", e);
                std::process::exit(DATA_ERR);
            }
        },
        None => catalog.sections(book_id),
    };

    let mut queue = DownloadQueue::open(&config.queue_file)?;
    let added = sections.iter().filter(|s| queue.enqueue(s)).count();
    queue.save()?;
    println!(
        "{GREEN}[OK]{RESET} Queued {} section(s) of {} ({} already queued)",
        added,
        book.title,
        sections.len() - added
    );
    Ok(())
}

fn show_queue(config: &Config) -> Result<()> {
    let queue = DownloadQueue::open(&config.queue_file)?;
    if queue.is_empty() {
        println!("{DIM}Download queue is empty.{RESET}");
        return Ok(());
    }
    println!("{BOLD}Download queue{RESET} ({} entries)", queue.len());
    for entry in queue.ordered() {
        let marker = if entry.sequence == JUMP_SEQUENCE {
            format!("{CYAN}*{RESET}")
        } else {
            " ".to_string()
        };
        println!(
            "{} {:>8}  {:>5.1}%  {:>12}  {}",
            marker,
            entry.key().to_string(),
            entry.percent(),
            format_bytes(entry.total_bytes),
            entry.url
        );
    }
    Ok(())
}

fn cancel(config: &Config, book_id: BookId, section: u32) -> Result<()> {
    let mut queue = DownloadQueue::open(&config.queue_file)?;
    let key = SectionKey::new(book_id, section);
    if queue.remove(key).is_some() {
        queue.save()?;
        println!("{GREEN}[OK]{RESET} Removed {} from the queue", key);
    } else {
        println!("{YELLOW}[!]{RESET} {} is not queued", key);
    }
    Ok(())
}

fn delete_book(catalog: &MemoryCatalog, store: &FileStore, config: &Config, book_id: BookId) -> Result<()> {
    require_book(catalog, book_id);
    let mut queue = DownloadQueue::open(&config.queue_file)?;
    let removed = queue.remove_book(book_id);
    queue.save()?;
    let freed = store.delete_book_files(book_id)?;
    println!(
        "{GREEN}[OK]{RESET} Freed {}, removed {} queued request(s)",
        format_bytes(freed),
        removed
    );
    Ok(())
}

async fn run_fetch(config: &Config, catalog: Arc<MemoryCatalog>, catalog_path: &Path) -> Result<()> {
    use indicatif::{ProgressBar, ProgressStyle};

    let queue = DownloadQueue::open(&config.queue_file)?;
    if queue.is_empty() {
        println!("{DIM}Nothing to download.{RESET}");
        return Ok(());
    }
    let pending = queue.len();

    let store = FileStore::new(&config.library_dir, catalog.clone());
    let worker = DownloadWorker::builder(queue.into_shared(), store, Arc::new(HttpFetcher::new()?))
        .tunables(config.download.clone())
        .build();

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
            .unwrap()
            .progress_chars("█▓░")
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Starting {} download(s)...", pending));

    let mut progress = worker.subscribe();
    let pb_clone = pb.clone();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let Some(update) = progress.borrow_and_update().clone() else {
                continue;
            };
            pb_clone.set_position(update.percent() as u64);
            let mut message = format!(
                "{} {} / {}",
                update.key,
                format_bytes(update.downloaded_bytes),
                format_bytes(update.total_bytes)
            );
            if let Some(speed) = update.speed_string() {
                message.push_str(&format!(" | {}", speed));
            }
            if let Some(eta) = update.eta_string() {
                message.push_str(&format!(" | ETA {}", eta));
            }
            pb_clone.set_message(message);
        }
    });

    worker.start();
    let outcome = worker.join().await;
    reporter.abort();
    pb.finish_and_clear();

    // sizes may have been corrected from server headers
    save_catalog(&catalog, catalog_path)?;

    let summary = match outcome {
        Some(Ok(summary)) => summary,
        Some(Err(e)) => return Err(e).context("Download run failed"),
        None => bail!("Download run was aborted"),
    };

    if summary.failed.is_empty() {
        println!("{GREEN}[OK]{RESET} {}", summary);
        return Ok(());
    }
    println!("{YELLOW}[!]{RESET} {}", summary);
    std::process::exit(TEMP_FAIL);
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let catalog_path = cli
        .catalog
        .clone()
        .unwrap_or_else(|| default_catalog_path(&config));
    let catalog = Arc::new(load_catalog(&catalog_path)?);
    let store = FileStore::new(&config.library_dir, catalog.clone());

    match cli.command {
        Commands::Books => list_books(&catalog, &store),
        Commands::Sections { book } => list_sections(&catalog, &store, book),
        Commands::AddBook {
            id,
            external_id,
            title,
            author,
        } => {
            let book = Book {
                id,
                external_id,
                title,
                author,
                num_sections: 0,
                current_section: 1,
                current_position_ms: 0,
            };
            let title = book.title.clone();
            catalog.insert_book(book, Vec::new());
            save_catalog(&catalog, &catalog_path)?;
            println!("{GREEN}[OK]{RESET} Added book {} ({})", id, title);
        }
        Commands::AddSection {
            book,
            url,
            size,
            duration,
            title,
        } => {
            let number = add_section(&catalog, book, url, size, &duration, title)?;
            save_catalog(&catalog, &catalog_path)?;
            println!("{GREEN}[OK]{RESET} Added section {}", SectionKey::new(book, number));
        }
        Commands::Enqueue { book, section } => enqueue(&catalog, &config, book, section)?,
        Commands::Queue => show_queue(&config)?,
        Commands::Cancel { book, section } => cancel(&config, book, section)?,
        Commands::Fetch => {
            let runtime = tokio::runtime::Runtime::new()
                .context("Failed to create Tokio runtime")?;
            runtime.block_on(run_fetch(&config, catalog.clone(), &catalog_path))?;
        }
        Commands::Delete { book } => delete_book(&catalog, &store, &config, book)?,
        Commands::Usage => {
            println!(
                "{BOLD}Library{RESET} {}: {}",
                store.root().display(),
                format_bytes(store.library_usage())
            );
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
