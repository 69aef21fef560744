use aerocache::cache::{self, ResultCache};
use aerocache::config;
use aerocache::evaluate::{Evaluation, Evaluator};
use aerocache::geometry::Case;
use aerocache::io;
use aerocache::parser;
use aerocache::record::ResultRecord;
use aerocache::runner::ScriptRunner;
use aerocache::Flavor;
use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SCHEMA_VERSION: &str = "1.0.0";
const PROGRAM_ID: &str = "aerocache";

#[derive(Parser, Debug)]
#[command(name = "aerocache")]
#[command(version)]
#[command(about = "Cached geometry + aerodynamic solver runs for conceptual aircraft design")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Output path (file)
    #[arg(short, long, global = true)]
    out: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Evaluate the configured design point through the cache
    Run {
        /// Write a JSON result bundle next to the CSV
        #[arg(long)]
        json: bool,
    },
    /// Evaluate the configured design point over the [sweep] Mach range
    Sweep {
        #[arg(long)]
        json: bool,
    },
    /// Report whether the configured design point is cached, without running tools
    Lookup,
    /// List the entries of a cache directory
    Cache {
        /// Cache directory (defaults to [cache].dir of --config)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Parse a solver output file (.stab, .lod or .polar) and print it as JSON
    Parse {
        file: PathBuf,
        /// Component id for .lod files
        #[arg(long, default_value = "1")]
        component: String,
        /// Column for .polar files
        #[arg(long, default_value = "E")]
        column: String,
    },
    /// Print the derived engine layout of a wing_rotor configuration
    Layout,
    /// Validate a configuration file
    Validate,
    /// Print version information
    Version,
}

// ============================================================================
// JSON Output Structures
// ============================================================================

#[derive(Serialize)]
struct Manifest {
    schema_version: String,
    version: String,
    program_id: String,
    timestamp_utc: String,
    platform: String,
    config_hash: String,
    config_snapshot: config::Root,
}

#[derive(Serialize)]
struct Summary {
    flavor: Flavor,
    cache_hit: bool,
    cache_index: usize,
    fingerprint: Vec<(String, f64)>,
    excluded_fields: usize,
    wall_time_ms: f64,
}

#[derive(Serialize)]
struct ResultBundle {
    manifest: Manifest,
    summary: Summary,
    record: ResultRecord,
}

#[derive(Serialize)]
struct SweepPoint {
    mach: f64,
    cache_hit: bool,
    cache_index: usize,
    record: ResultRecord,
}

#[derive(Serialize)]
struct SweepSummary {
    manifest: Manifest,
    points: Vec<SweepPoint>,
    cache_hits: usize,
    wall_time_ms: f64,
}

// ============================================================================
// Helper Functions
// ============================================================================

fn compute_hash(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn create_manifest(cfg: &config::Root, cfg_text: &str) -> Manifest {
    Manifest {
        schema_version: SCHEMA_VERSION.to_string(),
        version: VERSION.to_string(),
        program_id: PROGRAM_ID.to_string(),
        timestamp_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        config_hash: compute_hash(cfg_text),
        config_snapshot: cfg.clone(),
    }
}

fn create_summary(eval: &Evaluation, flavor: Flavor, wall_time_ms: f64) -> Summary {
    Summary {
        flavor,
        cache_hit: eval.cache_hit,
        cache_index: eval.entry.index,
        fingerprint: eval.fingerprint.fields().to_vec(),
        excluded_fields: eval.fingerprint.excluded(),
        wall_time_ms,
    }
}

fn load_config(cfg_path: &str) -> Result<(config::Root, String)> {
    config::Root::load_with_text(Path::new(cfg_path))
}

fn ensure_parent(path: &str) -> Result<()> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    Ok(())
}

/// Headline coefficients reported per sweep point.
fn headline(flavor: Flavor) -> [&'static str; 2] {
    match flavor {
        Flavor::WingRotor => ["CL", "CDi"],
        _ => ["CL_alpha", "CMm_alpha"],
    }
}

fn format_scalar(record: &ResultRecord, name: &str) -> String {
    record
        .scalar(name)
        .map(|v| format!("{:.6}", v))
        .unwrap_or_default()
}

// ============================================================================
// Commands
// ============================================================================

fn run_single(cfg: &config::Root, cfg_text: &str, out_path: &str, json_output: bool) -> Result<()> {
    let case = Case::from_config(cfg)?;
    let evaluator = Evaluator::from_config(cfg, ScriptRunner::new())?;

    let start = Instant::now();
    let eval = evaluator.evaluate(&case)?;
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;

    ensure_parent(out_path)?;
    io::write_record(Path::new(out_path), &eval.record)?;

    let [first, second] = headline(case.flavor);
    eprintln!(
        "[aerocache] {} index={} {}={} {}={} ({:.1}ms)",
        if eval.cache_hit { "hit" } else { "computed" },
        eval.entry.index,
        first,
        format_scalar(&eval.record, first),
        second,
        format_scalar(&eval.record, second),
        wall_time_ms
    );

    if json_output {
        let json_path = out_path.replace(".csv", ".json");
        let bundle = ResultBundle {
            manifest: create_manifest(cfg, cfg_text),
            summary: create_summary(&eval, case.flavor, wall_time_ms),
            record: eval.record,
        };
        let json = serde_json::to_string_pretty(&bundle)?;
        fs::write(&json_path, json)?;
        eprintln!("[aerocache] JSON bundle: {}", json_path);
    }

    Ok(())
}

fn run_sweep(cfg: &config::Root, cfg_text: &str, out_path: &str, json_output: bool) -> Result<()> {
    let sweep = cfg.sweep.as_ref().context("[sweep] section required for sweep mode")?;
    let evaluator = Evaluator::from_config(cfg, ScriptRunner::new())?;
    let columns = headline(cfg.run.flavor);

    ensure_parent(out_path)?;
    let mut w = io::CsvWriter::create(Path::new(out_path))?;
    w.write_header(&["case", "mach", "cache_hit", "cache_index", columns[0], columns[1]])?;

    let start = Instant::now();
    let mut points = Vec::new();
    let mut hits = 0;

    for (i, mach) in sweep.points().into_iter().enumerate() {
        let mut point_cfg = cfg.clone();
        point_cfg.flow.mach = mach;
        let case = Case::from_config(&point_cfg)?;
        let eval = evaluator
            .evaluate(&case)
            .with_context(|| format!("sweep point {} (mach={:.4})", i, mach))?;

        w.write_row(
            &format!("sweep_{:04}", i),
            &[
                format!("{:.6}", mach),
                u8::from(eval.cache_hit).to_string(),
                eval.entry.index.to_string(),
                format_scalar(&eval.record, columns[0]),
                format_scalar(&eval.record, columns[1]),
            ],
        )?;

        if eval.cache_hit {
            hits += 1;
        }
        if json_output {
            points.push(SweepPoint {
                mach,
                cache_hit: eval.cache_hit,
                cache_index: eval.entry.index,
                record: eval.record,
            });
        }
    }

    w.flush()?;
    let wall_time_ms = start.elapsed().as_secs_f64() * 1000.0;
    eprintln!(
        "[aerocache] sweep complete: {} points, {} from cache, in {:.1}ms",
        sweep.mach_n, hits, wall_time_ms
    );

    if json_output {
        let json_path = out_path.replace(".csv", "_summary.json");
        let summary = SweepSummary {
            manifest: create_manifest(cfg, cfg_text),
            points,
            cache_hits: hits,
            wall_time_ms,
        };
        let json = serde_json::to_string_pretty(&summary)?;
        fs::write(&json_path, json)?;
        eprintln!("[aerocache] JSON summary: {}", json_path);
    }

    Ok(())
}

fn run_lookup(cfg: &config::Root) -> Result<()> {
    let case = Case::from_config(cfg)?;
    let evaluator = Evaluator::from_config(cfg, ScriptRunner::new())?;
    match evaluator.lookup(&case)? {
        Some(eval) => {
            eprintln!(
                "[aerocache] hit index={} ({} coefficients)",
                eval.entry.index,
                eval.record.len()
            );
            println!("{}", serde_json::to_string_pretty(&eval.record)?);
        }
        None => eprintln!("[aerocache] miss in {}", evaluator.cache().dir().display()),
    }
    Ok(())
}

fn list_cache(dir: &Path) -> Result<()> {
    let cache = ResultCache::open(dir)?;
    let entries = cache.entries();
    eprintln!("[aerocache] {} entries in {}", entries.len(), dir.display());
    for entry in &entries {
        let status = if entry.is_complete() { "complete" } else { "orphan" };
        match cache::read_fingerprint(&entry.geometry_file) {
            Ok(fp) => {
                let head: Vec<String> = fp
                    .fields()
                    .iter()
                    .take(5)
                    .map(|(n, v)| format!("{}={}", n, v))
                    .collect();
                println!("{:>5}  {:<8}  {} ...", entry.index, status, head.join(" "));
            }
            Err(e) => println!("{:>5}  corrupt   {}", entry.index, e),
        }
    }
    Ok(())
}

fn parse_file(file: &Path, component: &str, column: &str) -> Result<()> {
    let record = match file.extension().and_then(|e| e.to_str()) {
        Some("stab") => parser::parse_stability(file)?.to_record(),
        Some("lod") => parser::parse_load_distribution(file, component)?.to_record(),
        Some("polar") => {
            let mut record = ResultRecord::new();
            record.insert_scalar(column, parser::parse_polar(file, column)?);
            record
        }
        _ => bail!("unsupported output file {} (expected .stab, .lod or .polar)", file.display()),
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn print_layout(cfg: &config::Root) -> Result<()> {
    let case = Case::from_config(cfg)?;
    let layout = case
        .layout
        .context("layout requires flavor = \"wing_rotor\" and an [engines] section")?;
    eprintln!("[aerocache] layout {:?}, {} engines", layout.kind, layout.len());
    println!("index,site,x,y,z,rpm");
    for e in &layout.engines {
        println!(
            "{},{:?},{:.4},{:.4},{:.4},{:.1}",
            e.index, e.site, e.position[0], e.position[1], e.position[2], e.rpm
        );
    }
    Ok(())
}

fn validate_config(cfg_path: &str) -> Result<()> {
    let (cfg, _) = load_config(cfg_path)?;
    let case = Case::from_config(&cfg)?;
    let fingerprint = case.fingerprint()?;

    eprintln!("[aerocache] config valid: {}", cfg_path);
    eprintln!("  flavor: {:?} ({} fingerprint fields, {} excluded)",
              cfg.run.flavor, fingerprint.fields().len(), fingerprint.excluded());
    eprintln!("  tools: {} / {}",
              cfg.toolkit.geometry_tool.display(), cfg.toolkit.aero_solver.display());
    eprintln!("  cache: {} (lock={})", cfg.cache.dir.display(), cfg.cache.lock);
    eprintln!("  flow: mach={}, alpha={}, velocity={}", cfg.flow.mach, cfg.flow.alpha, cfg.flow.velocity);
    if let Some(sweep) = &cfg.sweep {
        eprintln!("  sweep: mach=[{},{}]x{}", sweep.mach_min, sweep.mach_max, sweep.mach_n);
    }
    if let Some(layout) = &case.layout {
        eprintln!("  engines: {:?}, {} rotors", layout.kind, layout.len());
    }
    Ok(())
}

fn print_version() {
    eprintln!("aerocache v{}", VERSION);
    eprintln!("Schema version: {}", SCHEMA_VERSION);
    eprintln!();
    eprintln!("Flavors:");
    eprintln!("  - aircraft:               wing + tails, stability derivatives");
    eprintln!("  - aircraft_with_fuselage: wing + tails + fuselage, stability derivatives");
    eprintln!("  - wing_rotor:             wing + propellers, span loads and span efficiency");
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}

// ============================================================================
// Main
// ============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match args.command {
        Commands::Version => {
            print_version();
            Ok(())
        }
        Commands::Validate => {
            let cfg_path = args.config.context("--config required for validate")?;
            validate_config(&cfg_path)
        }
        Commands::Parse { file, component, column } => parse_file(&file, &component, &column),
        Commands::Cache { dir } => {
            let dir = match (dir, args.config) {
                (Some(dir), _) => dir,
                (None, Some(cfg_path)) => load_config(&cfg_path)?.0.cache.dir,
                (None, None) => bail!("--dir or --config required"),
            };
            list_cache(&dir)
        }
        Commands::Layout => {
            let cfg_path = args.config.context("--config required")?;
            let (cfg, _) = load_config(&cfg_path)?;
            print_layout(&cfg)
        }
        Commands::Lookup => {
            let cfg_path = args.config.context("--config required")?;
            let (cfg, _) = load_config(&cfg_path)?;
            run_lookup(&cfg)
        }
        Commands::Run { json } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/record.csv".to_string());
            let (cfg, cfg_text) = load_config(&cfg_path)?;
            eprintln!("[aerocache] v{} - {:?}", VERSION, cfg.run.flavor);
            run_single(&cfg, &cfg_text, &out_path, json)
        }
        Commands::Sweep { json } => {
            let cfg_path = args.config.context("--config required")?;
            let out_path = args.out.unwrap_or_else(|| "results/mach_sweep.csv".to_string());
            let (cfg, cfg_text) = load_config(&cfg_path)?;
            eprintln!("[aerocache] v{} - {:?}", VERSION, cfg.run.flavor);
            run_sweep(&cfg, &cfg_text, &out_path, json)
        }
    }
}
