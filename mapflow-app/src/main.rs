use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use fxhash::FxHashMap;
use mapflow::core::geo::LatLngBounds;
use mapflow::core::viewport::Viewport;
use mapflow::{
    constants::TILE_SIZE, PipelineConfig, PipelineContext, PipelineProfile, Session, Tile,
    TileError, TileObserver,
};
use std::cell::RefCell;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Balanced,
    Low,
    High,
}

/// Headless tile prefetcher: loads a style and fetches every tile covering
/// a bounding box over a zoom range, warming the cache.
#[derive(Debug, Parser)]
#[command(name = "mapflow-app", version)]
struct Args {
    /// Style document, as a local path or a URL
    style: String,

    /// Bounding box as `west,south,east,north` in degrees
    #[arg(long, default_value = "-180,-85,180,85", allow_hyphen_values = true)]
    bbox: String,

    #[arg(long, default_value_t = 0)]
    min_zoom: u8,

    #[arg(long, default_value_t = 2)]
    max_zoom: u8,

    #[arg(long, value_enum, default_value_t = Profile::Balanced)]
    profile: Profile,

    /// JSON pipeline config; overrides the profile
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the persistent cache tier
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Seconds to wait for each zoom level to settle
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

#[derive(Default)]
struct Tally {
    loaded: RefCell<FxHashMap<String, usize>>,
    failed: RefCell<FxHashMap<String, usize>>,
}

impl TileObserver for Tally {
    fn on_tile_loaded(&self, tile: &Tile, first_load: bool) {
        if first_load {
            *self.loaded.borrow_mut().entry(tile.source_id().to_string()).or_default() += 1;
        }
    }

    fn on_tile_error(&self, tile: &Tile, error: &TileError) {
        log::warn!("tile {} of {}: {}", tile.id(), tile.source_id(), error);
        *self.failed.borrow_mut().entry(tile.source_id().to_string()).or_default() += 1;
    }
}

fn parse_bbox(value: &str) -> anyhow::Result<LatLngBounds> {
    let parts = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid bbox {:?}", value))?;
    let [west, south, east, north] = parts[..] else {
        bail!("bbox needs four numbers, got {}", parts.len());
    };
    if west >= east || south >= north {
        bail!("bbox must satisfy west < east and south < north");
    }
    Ok(LatLngBounds::from_coords(south, west, north, east))
}

fn load_config(args: &Args) -> anyhow::Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => match args.profile {
            Profile::Balanced => PipelineProfile::Balanced,
            Profile::Low => PipelineProfile::LowResource,
            Profile::High => PipelineProfile::HighPerformance,
        }
        .resolve(),
    };
    if let Some(dir) = &args.cache_dir {
        config.cache.disk_path = Some(dir.clone());
    }
    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    if args.min_zoom > args.max_zoom {
        bail!("--min-zoom must not exceed --max-zoom");
    }
    let bounds = parse_bbox(&args.bbox)?;
    let config = load_config(&args)?;

    let context = Arc::new(PipelineContext::new(config)?);
    let mut session = Session::new(context.clone());
    let tally = Arc::new(Tally::default());
    let observer: Arc<dyn TileObserver> = tally.clone();
    session.set_tile_observer(Arc::downgrade(&observer));

    let started = Instant::now();
    let timeout = Duration::from_secs(args.timeout);
    let path = PathBuf::from(&args.style);
    if path.exists() {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        session.load_style_json(&json)?;
    } else {
        session.load_style_url(&args.style);
    }
    if !session.run_until_idle(timeout) && session.style().is_none() {
        bail!("style {} did not load within {:?}", args.style, timeout);
    }
    let style = session.style().context("style failed to load")?;
    println!(
        "style {}: {} sources, {} layers",
        style.name.as_deref().unwrap_or(&args.style),
        style.sources.len(),
        style.layers().len()
    );

    for zoom in args.min_zoom..=args.max_zoom {
        session.set_viewport(Viewport::fit(&bounds, zoom as f64, TILE_SIZE));
        let settled = session.run_until_idle(timeout);
        let tiles: usize = session.pyramids().map(|pyramid| pyramid.len()).sum();
        println!(
            "z{:<2} {:>5} tiles{}",
            zoom,
            tiles,
            if settled { "" } else { " (timed out)" }
        );
    }

    let stats = context.cache().stats();
    println!("done in {:.1}s", started.elapsed().as_secs_f64());
    for pyramid in session.pyramids() {
        let id = pyramid.source_id();
        println!(
            "  {}: {} loaded, {} failed",
            id,
            tally.loaded.borrow().get(id).copied().unwrap_or(0),
            tally.failed.borrow().get(id).copied().unwrap_or(0)
        );
    }
    println!(
        "  cache: {} entries, {} bytes, hit rate {:.0}%, {} upstream requests",
        stats.size,
        stats.bytes,
        stats.hit_rate() * 100.0,
        context.file_source().upstream_request_count()
    );
    Ok(())
}
