//! CandleVault CLI — backfill, aggregate, repair and export commands.
//!
//! Commands:
//! - `backfill` — fill missing base candles for each (venue, symbol) pair
//! - `aggregate` — roll the base series up into higher timeframes
//! - `repair-gaps` — re-fetch holes inside already covered ranges
//! - `coverage` — report what each series has persisted
//! - `export` — write stored candles as CSV

use anyhow::{bail, Context as _, Result};
use candlevault_core::aggregate::{AggregateReport, AggregateRequest, AggregationEngine};
use candlevault_core::backfill::{
    BackfillEngine, BackfillOutcome, BackfillReport, BackfillRequest, RetryPolicy, TracingProgress,
};
use candlevault_core::clock::{format_timestamp_ms, parse_timestamp_ms, EndBound, SystemClock};
use candlevault_core::config::AppConfig;
use candlevault_core::coverage::covered_ms;
use candlevault_core::export::export_csv;
use candlevault_core::repair::{GapRepair, GapRepairConfig, RepairReport};
use candlevault_core::venue::binance::{self, BinanceSpotVenue};
use candlevault_core::venue::{CircuitBreaker, VenueRegistry};
use candlevault_core::{CandleStore, SeriesKey, SqliteStore, TimeRange, Timeframe, ONE_MINUTE};
use clap::{Parser, Subcommand};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_DB: &str = "data/candlevault.sqlite";

#[derive(Parser)]
#[command(
    name = "candlevault",
    about = "CandleVault CLI — coverage-tracked candle backfill and aggregation"
)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database path. Overrides `[data] db_path`.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Print reports as JSON on stdout.
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fill missing base candles for each configured pair.
    Backfill {
        /// Symbol(s) to backfill (e.g., BTC/USDT). Defaults to `[history] symbols`.
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        /// Venue id. Defaults to `[history] market_data_venue`.
        #[arg(long)]
        venue: Option<String>,

        /// Start (RFC 3339 or YYYY-MM-DD). Defaults to `[history] start_date`.
        #[arg(long)]
        start: Option<String>,

        /// End (RFC 3339 or YYYY-MM-DD). Defaults to now.
        #[arg(long)]
        end: Option<String>,

        /// Window size in days.
        #[arg(long)]
        chunk_days: Option<u32>,

        /// Aggregate each pair that completed into `[aggregate] timeframes`.
        #[arg(long, default_value_t = false)]
        aggregate: bool,
    },
    /// Roll the base series up into higher timeframes.
    Aggregate {
        /// Symbol(s) to aggregate. Defaults to `[history] symbols`.
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        #[arg(long)]
        venue: Option<String>,

        /// Comma-separated targets, e.g. 5m,15m,1h,4h.
        #[arg(long)]
        timeframes: Option<String>,

        /// Base rows are read this many days at a time.
        #[arg(long)]
        chunk_days: Option<u32>,

        /// Start. Defaults to resuming from the last aggregated bucket.
        #[arg(long)]
        start: Option<String>,

        /// End. Defaults to now.
        #[arg(long)]
        end: Option<String>,
    },
    /// Re-fetch holes inside covered base ranges. Coverage is left unchanged.
    RepairGaps {
        #[arg(long = "symbol")]
        symbols: Vec<String>,

        #[arg(long)]
        venue: Option<String>,

        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,
    },
    /// Report persisted coverage per series.
    Coverage {
        #[arg(long)]
        venue: Option<String>,

        #[arg(long)]
        symbol: Option<String>,
    },
    /// Write stored candles of one timeframe as CSV.
    Export {
        #[arg(long)]
        venue: Option<String>,

        #[arg(long)]
        symbol: String,

        /// Timeframe label. Defaults to the base timeframe.
        #[arg(long)]
        timeframe: Option<String>,

        #[arg(long)]
        start: String,

        /// End. Defaults to now.
        #[arg(long)]
        end: Option<String>,

        /// Output file. Defaults to stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

/// Settings shared by every command.
struct Context {
    config: Option<AppConfig>,
    db: PathBuf,
    json: bool,
    cancel: Arc<AtomicBool>,
}

impl Context {
    fn base_timeframe(&self) -> Timeframe {
        self.config
            .as_ref()
            .map_or(ONE_MINUTE, |c| c.history.base_timeframe)
    }

    fn venue(&self, flag: Option<String>) -> String {
        flag.or_else(|| {
            self.config
                .as_ref()
                .map(|c| c.history.market_data_venue.clone())
        })
        .unwrap_or_else(|| binance::VENUE_ID.to_string())
    }

    fn symbols(&self, flag: Vec<String>) -> Result<Vec<String>> {
        if !flag.is_empty() {
            return Ok(flag);
        }
        match &self.config {
            Some(cfg) => Ok(cfg.history.symbols.clone()),
            None => bail!("no symbols: pass --symbol or a --config with [history] symbols"),
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config
            .as_ref()
            .map_or_else(RetryPolicy::default, |c| c.retry.policy())
    }

    fn open_store(&self) -> Result<Arc<SqliteStore>> {
        let store = SqliteStore::open(&self.db, self.base_timeframe())
            .with_context(|| format!("opening store {}", self.db.display()))?;
        Ok(Arc::new(store))
    }

    fn venue_registry(&self) -> Result<VenueRegistry> {
        if let Some(cfg) = &self.config {
            return Ok(cfg.venue_registry()?);
        }
        let breaker = Arc::new(CircuitBreaker::default_venue(binance::VENUE_ID));
        let binance = BinanceSpotVenue::new(None, breaker)?;
        Ok(VenueRegistry::new().with(Arc::new(binance)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli
        .config
        .as_deref()
        .map(AppConfig::from_file)
        .transpose()?;
    let db = cli
        .db
        .or_else(|| config.as_ref().map(|c| c.data.db_path.clone()))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping at the next window boundary");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    let ctx = Context {
        config,
        db,
        json: cli.json,
        cancel,
    };
    let command = cli.command;
    // Engines block on SQLite and HTTP; keep them off the async workers.
    let succeeded = tokio::task::spawn_blocking(move || run_command(command, &ctx)).await??;

    if !succeeded {
        std::process::exit(1);
    }
    Ok(())
}

fn run_command(command: Commands, ctx: &Context) -> Result<bool> {
    match command {
        Commands::Backfill {
            symbols,
            venue,
            start,
            end,
            chunk_days,
            aggregate,
        } => run_backfill(ctx, symbols, venue, start, end, chunk_days, aggregate),
        Commands::Aggregate {
            symbols,
            venue,
            timeframes,
            chunk_days,
            start,
            end,
        } => run_aggregate(ctx, symbols, venue, timeframes, chunk_days, start, end),
        Commands::RepairGaps {
            symbols,
            venue,
            start,
            end,
        } => run_repair(ctx, symbols, venue, start, end),
        Commands::Coverage { venue, symbol } => run_coverage(ctx, venue, symbol),
        Commands::Export {
            venue,
            symbol,
            timeframe,
            start,
            end,
            out,
        } => run_export(ctx, venue, symbol, timeframe, start, end, out),
    }
}

fn parse_end(end: Option<&str>) -> Result<EndBound> {
    Ok(EndBound::from_option(end.map(parse_timestamp_ms).transpose()?))
}

#[allow(clippy::too_many_arguments)]
fn run_backfill(
    ctx: &Context,
    symbols: Vec<String>,
    venue: Option<String>,
    start: Option<String>,
    end: Option<String>,
    chunk_days: Option<u32>,
    aggregate: bool,
) -> Result<bool> {
    let venue = ctx.venue(venue);
    let symbols = ctx.symbols(symbols)?;
    let mut requests = match &ctx.config {
        Some(cfg) => cfg.backfill_requests(Some(venue.as_str()), &symbols)?,
        None => {
            let Some(start) = start.as_deref() else {
                bail!("no start: pass --start or a --config with [history] start_date");
            };
            let start_ms = parse_timestamp_ms(start)?;
            symbols
                .iter()
                .map(|s| BackfillRequest::new(venue.as_str(), s.as_str(), start_ms))
                .collect()
        }
    };
    for req in &mut requests {
        if let Some(start) = start.as_deref() {
            req.start_ms = parse_timestamp_ms(start)?;
        }
        if end.is_some() {
            req.end = parse_end(end.as_deref())?;
        }
        if let Some(days) = chunk_days {
            req.chunk_days = days;
        }
    }

    let store = ctx.open_store()?;
    let engine = BackfillEngine::new(store.clone(), ctx.venue_registry()?)
        .with_retry_policy(ctx.retry_policy())
        .with_cancel_flag(Arc::clone(&ctx.cancel));
    let reports = engine.run_many(&requests, &TracingProgress);

    let mut ok = reports.iter().all(BackfillReport::is_success);
    let mut aggregated = Vec::new();
    if aggregate && !ctx.cancel.load(Ordering::SeqCst) {
        let targets = aggregate_targets(ctx, None)?;
        let engine = AggregationEngine::new(store).with_cancel_flag(Arc::clone(&ctx.cancel));
        for report in reports.iter().filter(|r| r.is_success()) {
            let mut req = AggregateRequest::new(
                report.key.venue.as_str(),
                report.key.symbol.as_str(),
                targets.clone(),
            );
            req.base_timeframe = report.base_timeframe;
            match engine.run(&req) {
                Ok(agg) => aggregated.push(agg),
                Err(err) => {
                    eprintln!("Aggregation failed for {}: {err}", report.key);
                    ok = false;
                }
            }
        }
    }

    if ctx.json {
        let out = serde_json::json!({ "backfill": reports, "aggregate": aggregated });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for report in &reports {
            print_backfill(report);
        }
        for report in &aggregated {
            print_aggregate(report);
        }
    }
    Ok(ok)
}

fn aggregate_targets(ctx: &Context, flag: Option<&str>) -> Result<Vec<Timeframe>> {
    let targets = match (flag, &ctx.config) {
        (Some(list), _) => Timeframe::parse_list(list)?,
        (None, Some(cfg)) => cfg.aggregate.timeframes.clone(),
        (None, None) => Timeframe::parse_list("5m,15m,1h,4h")?,
    };
    if targets.is_empty() {
        bail!("no target timeframes given");
    }
    Ok(targets)
}

#[allow(clippy::too_many_arguments)]
fn run_aggregate(
    ctx: &Context,
    symbols: Vec<String>,
    venue: Option<String>,
    timeframes: Option<String>,
    chunk_days: Option<u32>,
    start: Option<String>,
    end: Option<String>,
) -> Result<bool> {
    let venue = ctx.venue(venue);
    let symbols = ctx.symbols(symbols)?;
    let targets = aggregate_targets(ctx, timeframes.as_deref())?;
    let chunk_days = chunk_days
        .or_else(|| ctx.config.as_ref().map(|c| c.aggregate.chunk_days))
        .unwrap_or(7);
    let start_ms = start.as_deref().map(parse_timestamp_ms).transpose()?;
    let end = parse_end(end.as_deref())?;

    let engine = AggregationEngine::new(ctx.open_store()?).with_cancel_flag(Arc::clone(&ctx.cancel));
    let mut ok = true;
    let mut reports = Vec::new();
    for symbol in &symbols {
        let mut req = AggregateRequest::new(venue.as_str(), symbol.as_str(), targets.clone())
            .with_end(end)
            .with_chunk_days(chunk_days);
        req.base_timeframe = ctx.base_timeframe();
        if let Some(start) = start_ms {
            req = req.with_start(start);
        }
        match engine.run(&req) {
            Ok(report) => reports.push(report),
            Err(err) => {
                eprintln!("Error for {}: {err}", req.key);
                ok = false;
            }
        }
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        reports.iter().for_each(print_aggregate);
    }
    Ok(ok)
}

fn run_repair(
    ctx: &Context,
    symbols: Vec<String>,
    venue: Option<String>,
    start: Option<String>,
    end: Option<String>,
) -> Result<bool> {
    let venue = ctx.venue(venue);
    let symbols = ctx.symbols(symbols)?;
    let start_ms = match start.as_deref() {
        Some(s) => parse_timestamp_ms(s)?,
        None => match &ctx.config {
            Some(cfg) => cfg.start_ms()?,
            None => 0,
        },
    };
    let end_ms = parse_end(end.as_deref())?.resolve(&SystemClock);
    let scan = TimeRange::new(start_ms, end_ms);
    let settings = ctx
        .config
        .as_ref()
        .map_or_else(GapRepairConfig::default, |c| c.repair.settings());

    let repair = GapRepair::new(
        ctx.open_store()?,
        ctx.venue_registry()?,
        ctx.base_timeframe(),
        settings,
    )
    .with_retry_policy(ctx.retry_policy())
    .with_cancel_flag(Arc::clone(&ctx.cancel));

    let mut ok = true;
    let mut reports: Vec<(SeriesKey, RepairReport)> = Vec::new();
    for symbol in &symbols {
        let key = SeriesKey::new(venue.as_str(), symbol.as_str());
        match repair.run(&key, scan) {
            Ok(report) => {
                ok &= report.is_success();
                reports.push((key, report));
            }
            Err(err) => {
                eprintln!("Error for {key}: {err}");
                ok = false;
            }
        }
    }

    if ctx.json {
        let out: Vec<_> = reports
            .iter()
            .map(|(key, report)| serde_json::json!({ "series": key, "report": report }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        for (key, report) in &reports {
            println!();
            println!("=== Gap Repair: {key} ===");
            println!("Gaps found:     {}", report.gaps_found.len());
            println!("Skipped:        {} (over max_gap_minutes)", report.skipped.len());
            println!("Repaired:       {} gap(s), {} rows written", report.attempted, report.written);
            for (window, err) in &report.failed {
                println!("FAILED:         {window}: {err}");
            }
            if report.cancelled {
                println!("Cancelled before completion.");
            }
        }
    }
    Ok(ok)
}

fn run_coverage(ctx: &Context, venue: Option<String>, symbol: Option<String>) -> Result<bool> {
    let store = ctx.open_store()?;
    let base = ctx.base_timeframe();
    let series: Vec<SeriesKey> = store
        .list_series(base)?
        .into_iter()
        .filter(|k| venue.as_deref().map_or(true, |v| k.venue == v))
        .filter(|k| symbol.as_deref().map_or(true, |s| k.symbol == s))
        .collect();

    let mut records = Vec::new();
    for key in &series {
        records.extend(store.get_coverage(key, base)?);
    }

    if ctx.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(true);
    }
    if series.is_empty() {
        println!("No coverage recorded in {}", ctx.db.display());
        return Ok(true);
    }

    println!("Store: {}", ctx.db.display());
    println!("Base timeframe: {base}");
    println!();
    println!("{:<14} {:<12} {:<44} {:>10}", "Venue", "Symbol", "Range", "Days");
    println!("{}", "-".repeat(83));
    for key in &series {
        let ranges: Vec<TimeRange> = records
            .iter()
            .filter(|r| r.venue == key.venue && r.symbol == key.symbol)
            .map(|r| r.range)
            .collect();
        for range in &ranges {
            let days = covered_ms(&ranges, range.start_ms, range.end_ms) as f64 / 86_400_000.0;
            println!(
                "{:<14} {:<12} {:<44} {:>10.2}",
                key.venue, key.symbol, range.to_string(), days
            );
        }
        if let Some((_, latest)) = store.time_bounds(key, base)? {
            println!("{:<27} latest candle {}", "", format_timestamp_ms(latest));
        }
    }
    Ok(true)
}

fn run_export(
    ctx: &Context,
    venue: Option<String>,
    symbol: String,
    timeframe: Option<String>,
    start: String,
    end: Option<String>,
    out: Option<PathBuf>,
) -> Result<bool> {
    let key = SeriesKey::new(ctx.venue(venue), symbol);
    let timeframe = match timeframe.as_deref() {
        Some(label) => Timeframe::parse(label)?,
        None => ctx.base_timeframe(),
    };
    let range = TimeRange::new(
        parse_timestamp_ms(&start)?,
        parse_end(end.as_deref())?.resolve(&SystemClock),
    );
    let store = ctx.open_store()?;

    let rows = match &out {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
            export_csv(&*store, &key, timeframe, range, BufWriter::new(file))?
        }
        None => {
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            let n = export_csv(&*store, &key, timeframe, range, &mut lock)?;
            lock.flush()?;
            n
        }
    };
    info!(series = %key, %timeframe, rows, "export complete");
    if let Some(path) = &out {
        eprintln!("Wrote {rows} rows to {}", path.display());
    }
    Ok(true)
}

fn print_backfill(report: &BackfillReport) {
    println!();
    println!("=== Backfill: {} ({}) ===", report.key, report.base_timeframe);
    println!("Requested:      {}", report.requested);
    println!("Windows:        {}", report.windows.len());
    println!("Rows written:   {}", report.rows_written());
    for range in report.committed() {
        println!("Covered:        {range}");
    }
    let gaps = report.zero_row_windows();
    if !gaps.is_empty() {
        println!("Upstream gaps:  {} window(s) returned no candles", gaps.len());
    }
    if report.warning_count() > 0 {
        println!("Discarded rows: {}", report.warning_count());
    }
    match &report.outcome {
        BackfillOutcome::Completed => println!("Status:         completed"),
        BackfillOutcome::Cancelled => println!("Status:         cancelled"),
        BackfillOutcome::Failed(err) => println!("Status:         FAILED: {err}"),
    }
    for range in &report.remaining {
        println!("Remaining:      {range}");
    }
}

fn print_aggregate(report: &AggregateReport) {
    println!();
    println!("=== Aggregate: {} ===", report.key);
    match &report.span {
        Some(span) => println!("Span:           {span}"),
        None => println!("Span:           (no base candles)"),
    }
    println!("Base rows read: {}", report.base_rows_read);
    println!();
    println!("{:<6} {:>8} {:>8} {:>6} {:>6}  {}", "TF", "Emitted", "Written", "Held", "Gaps", "Cursor");
    println!("{}", "-".repeat(62));
    for tf in &report.timeframes {
        let cursor = tf.cursor.map_or_else(|| "-".to_string(), format_timestamp_ms);
        println!(
            "{:<6} {:>8} {:>8} {:>6} {:>6}  {}",
            tf.timeframe.label(),
            tf.emitted,
            tf.written,
            tf.held.len(),
            tf.gaps.len(),
            cursor
        );
    }
    println!("Digest:         {}", report.digest);
}
