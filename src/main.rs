use std::collections::BTreeSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{error, info, warn};
use simplelog::{Config, LevelFilter, WriteLogger};

use pagecache::cache::{CacheValue, TwoTierCache};
use pagecache::jobs::{WorkerCoordinator, spawn_cache_janitor};
use pagecache::panic_handler;
use pagecache::pdf::{MupdfDecoder, PageRenderQueue, PageStatus, RenderEvent, page_key};
use pagecache::settings::{Settings, default_config_path};

/// Longest wait for a single page before giving up on the rest
const PAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Render PDF pages through the page cache
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Document to render
    pdf: PathBuf,

    /// Pages to render (0-based), e.g. "0-4,7"; all pages when omitted
    #[arg(long)]
    pages: Option<String>,

    /// Zoom factor
    #[arg(long)]
    scale: Option<f32>,

    /// Device pixel ratio of the target display
    #[arg(long)]
    dpr: Option<f32>,

    /// Disk cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Keep rendered pages in memory only
    #[arg(long, default_value_t = false)]
    no_persist: bool,

    /// Settings file (defaults to the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, default_value = "pagecache.log")]
    log_file: PathBuf,

    /// Log at debug level
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    WriteLogger::init(
        level,
        Config::default(),
        File::create(&args.log_file)
            .with_context(|| format!("creating log file {}", args.log_file.display()))?,
    )?;
    panic_handler::initialize_panic_handler();

    info!("Starting pagecache for {}", args.pdf.display());
    let result = run(&args);
    if let Err(e) = &result {
        error!("pagecache failed: {e:?}");
    }
    info!("Shutting down pagecache");
    result
}

fn run(args: &Args) -> Result<()> {
    let mut settings = match args.config.clone().or_else(default_config_path) {
        Some(path) => Settings::load_from(&path),
        None => Settings::default(),
    };
    if let Some(scale) = args.scale {
        settings.render.scale = scale;
    }
    if let Some(dpr) = args.dpr {
        settings.render.device_pixel_ratio = dpr;
    }
    if let Some(dir) = &args.cache_dir {
        settings.cache.disk_dir = Some(dir.clone());
    }
    if args.no_persist {
        settings.cache.persist = false;
    }
    let persist = settings.cache.persist;

    let coordinator = Arc::new(WorkerCoordinator::new(settings.worker_config()));
    let cache = Arc::new(TwoTierCache::new(settings.cache_config()));
    spawn_cache_janitor(&coordinator, Arc::clone(&cache)).context("starting cache janitor")?;

    let mut queue = PageRenderQueue::new(
        Arc::new(MupdfDecoder::new()),
        Arc::clone(&coordinator),
        settings.render_config(),
    );
    let page_count = queue
        .set_document(&args.pdf)
        .with_context(|| format!("opening {}", args.pdf.display()))?;

    let pages = match &args.pages {
        Some(list) => parse_pages(list, page_count)?,
        None => (0..page_count).collect(),
    };
    let transform = queue.state().transform();
    let key_of = |page: usize| page_key(&args.pdf, page, transform);

    let started = Instant::now();
    let mut pending = BTreeSet::new();
    let mut reused = 0usize;
    for &page in &pages {
        if cache.get(&key_of(page)).is_some() {
            reused += 1;
            continue;
        }
        match queue.get_page(page, pending.is_empty()) {
            PageStatus::Ready(bitmap) => {
                cache.put(key_of(page), CacheValue::Bitmap(bitmap), persist);
            }
            PageStatus::Pending => {
                pending.insert(page);
            }
            PageStatus::Unavailable => warn!("Page {page} unavailable"),
        }
    }

    let events = queue.events();
    let mut failed = 0usize;
    while !pending.is_empty() {
        let Ok(event) = events.recv_timeout(PAGE_TIMEOUT) else {
            bail!("timed out waiting for pages {pending:?}");
        };
        match event {
            RenderEvent::LoadStarted { .. } => {}
            RenderEvent::PageReady { page, bitmap } => {
                if pending.remove(&page) {
                    println!("page {page}: {}x{}", bitmap.width, bitmap.height);
                    cache.put(key_of(page), CacheValue::Bitmap(bitmap), persist);
                }
            }
            RenderEvent::RenderError { page, message } => {
                if pending.remove(&page) {
                    failed += 1;
                    println!("page {page}: failed ({message})");
                }
            }
        }
    }

    let info = queue.cache_info();
    println!(
        "rendered {} of {} pages in {:.2?} ({reused} from cache, {failed} failed)",
        pages.len() - reused - failed,
        pages.len(),
        started.elapsed()
    );
    println!(
        "render queue: {} cached, {} queued, {} bytes, hit ratio {:.2}",
        info.cached_pages, info.queue_len, info.memory_bytes, info.hit_ratio
    );
    let stats = cache.stats();
    println!(
        "cache: {} items, {} bytes, {} on disk, hits {}/{} (memory/disk), misses {}, hit ratio {:.2}",
        stats.items,
        stats.bytes,
        stats.disk_items,
        stats.memory_hits,
        stats.disk_hits,
        stats.misses,
        stats.hit_ratio
    );

    queue.cleanup();
    coordinator.cleanup();
    Ok(())
}

/// Parse "0-4,7,9-" style page lists against `page_count`
fn parse_pages(list: &str, page_count: usize) -> Result<Vec<usize>> {
    let mut pages = BTreeSet::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (start, end) = match part.split_once('-') {
            Some((start, end)) => {
                let start = start.trim().parse::<usize>().context("bad page range")?;
                let end = if end.trim().is_empty() {
                    page_count.saturating_sub(1)
                } else {
                    end.trim().parse::<usize>().context("bad page range")?
                };
                (start, end)
            }
            None => {
                let page = part.parse::<usize>().context("bad page number")?;
                (page, page)
            }
        };
        if start > end {
            bail!("empty page range {part}");
        }
        if end >= page_count {
            bail!("page {end} out of range, document has {page_count} pages");
        }
        pages.extend(start..=end);
    }
    Ok(pages.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_lists() {
        assert_eq!(parse_pages("0-2,7", 10).unwrap(), vec![0, 1, 2, 7]);
        assert_eq!(parse_pages("8-", 10).unwrap(), vec![8, 9]);
        assert_eq!(parse_pages("3,3,1", 10).unwrap(), vec![1, 3]);
        assert!(parse_pages("5-2", 10).is_err());
        assert!(parse_pages("12", 10).is_err());
    }
}
