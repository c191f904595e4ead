//! remfleet - CLI entry point.
//!
//! `serve` runs the HTTP surface; `run` executes a remediation run end to
//! end (also what the upload handler spawns); the remaining subcommands are
//! operator tooling over the same persisted state.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use remfleet::config::Config;
use remfleet::ingest;
use remfleet::memory::MemoryStore;
use remfleet::model::{BatchRun, Finding, RunMode};
use remfleet::scheduler::build_waves;
use remfleet::store::StateStore;
use remfleet::supervisor::{self, RunOptions};
use remfleet::{api, tracker::ProgressTracker};

#[derive(Parser)]
#[command(name = "remfleet", about = "Security remediation fleet orchestrator", version)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP surface (upload, run views, review, metrics)
    Serve,

    /// Parse and prioritize findings from a CSV file
    Ingest { csv_path: PathBuf },

    /// Show the wave plan for a CSV without dispatching anything
    Plan {
        csv_path: PathBuf,
        #[arg(long)]
        wave_size: Option<usize>,
    },

    /// Full pipeline: ingest, plan, dispatch, monitor
    Run {
        csv_path: PathBuf,
        /// Run id (defaults to a fresh 8-char id)
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        wave_size: Option<usize>,
        /// Run only this wave number
        #[arg(long)]
        wave: Option<u32>,
        /// Routing mode override: mock, live, or hybrid
        #[arg(long)]
        mode: Option<RunMode>,
        /// Use the real agent platform (disable mock)
        #[arg(long)]
        live: bool,
        /// Hybrid mode: real for connected repos, simulated for others
        #[arg(long)]
        hybrid: bool,
        /// Original upload filename recorded in the run index
        #[arg(long)]
        csv_filename: Option<String>,
        /// Show what would be dispatched without running
        #[arg(long)]
        dry_run: bool,
    },

    /// Show progress of the most recent run
    Status,

    /// Extract memory items from a completed run
    ExtractMemory {
        #[arg(long)]
        run_id: Option<String>,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "remfleet=debug" } else { "remfleet=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn load_findings(csv_path: &PathBuf) -> Result<Vec<Finding>> {
    let file = std::fs::File::open(csv_path)?;
    Ok(ingest::ingest_findings(file)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = Config::from_env()?;

    match cli.command {
        Command::Serve => api::serve(config).await,
        Command::Ingest { csv_path } => cmd_ingest(&csv_path),
        Command::Plan { csv_path, wave_size } => cmd_plan(&config, &csv_path, wave_size),
        Command::Run {
            csv_path,
            run_id,
            wave_size,
            wave,
            mode,
            live,
            hybrid,
            csv_filename,
            dry_run,
        } => {
            if let Some(mode) = mode {
                apply_mode(&mut config, mode);
            }
            if live {
                apply_mode(&mut config, RunMode::Live);
            }
            if hybrid {
                apply_mode(&mut config, RunMode::Hybrid);
            }
            cmd_run(&config, &csv_path, run_id, wave_size, wave, csv_filename, dry_run).await
        }
        Command::Status => cmd_status(&config),
        Command::ExtractMemory { run_id } => cmd_extract_memory(&config, run_id),
    }
}

fn apply_mode(config: &mut Config, mode: RunMode) {
    match mode {
        RunMode::Mock => {
            config.mock_mode = true;
            config.hybrid_mode = false;
        }
        RunMode::Live => {
            config.mock_mode = false;
            config.hybrid_mode = false;
        }
        RunMode::Hybrid => {
            config.mock_mode = false;
            config.hybrid_mode = true;
        }
    }
}

fn cmd_ingest(csv_path: &PathBuf) -> Result<()> {
    let findings = load_findings(csv_path)?;

    println!("\n{}", "=".repeat(60));
    println!("  Ingestion Summary");
    println!("{}", "=".repeat(60));
    println!("  Total findings: {}", findings.len());

    println!("\n  By severity:");
    for severity in ["critical", "high", "medium", "low"] {
        let count = findings.iter().filter(|f| f.severity.as_str() == severity).count();
        println!("    {:12} {}", severity.to_uppercase(), count);
    }

    let mut by_category: Vec<(&str, usize)> = Vec::new();
    for finding in &findings {
        let name = finding.category.as_str();
        match by_category.iter_mut().find(|(c, _)| *c == name) {
            Some((_, n)) => *n += 1,
            None => by_category.push((name, 1)),
        }
    }
    by_category.sort_by(|a, b| b.1.cmp(&a.1));
    println!("\n  By category:");
    for (category, count) in by_category {
        println!("    {category:30} {count}");
    }

    println!("\n  Top 5 by priority:");
    for finding in findings.iter().take(5) {
        println!(
            "    [{:5.1}] {} | {:8} | {:30} | {}",
            finding.priority_score,
            finding.finding_id,
            finding.severity.as_str(),
            finding.category.as_str(),
            finding.service_name
        );
    }
    println!("{}\n", "=".repeat(60));
    Ok(())
}

fn cmd_plan(config: &Config, csv_path: &PathBuf, wave_size: Option<usize>) -> Result<()> {
    let findings = load_findings(csv_path)?;
    let effective = wave_size.unwrap_or(config.wave_size);
    let waves = build_waves(findings, effective);

    println!("\n{}", "=".repeat(60));
    println!("  Remediation Plan");
    println!("{}", "=".repeat(60));
    println!("  Wave size: {effective}");
    println!("  Number of waves: {}", waves.len());

    for wave in &waves {
        println!("\n  Wave {} ({} findings):", wave.wave_number, wave.sessions.len());
        for session in &wave.sessions {
            let f = &session.finding;
            println!(
                "    {} | [{:5.1}] {:8} | {:30} | {}",
                f.finding_id,
                f.priority_score,
                f.severity.as_str(),
                f.category.as_str(),
                f.service_name
            );
        }
    }
    println!("\n{}\n", "=".repeat(60));
    Ok(())
}

async fn cmd_run(
    config: &Config,
    csv_path: &PathBuf,
    run_id: Option<String>,
    wave_size: Option<usize>,
    only_wave: Option<u32>,
    csv_filename: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let findings = load_findings(csv_path)?;
    let run_id = run_id.unwrap_or_else(|| Uuid::new_v4().simple().to_string()[..8].to_string());
    let mode = config.run_mode();

    println!("\n{}", "=".repeat(60));
    println!("  Starting remediation run {run_id}");
    println!("  Mode: {}", mode.as_str());
    println!(
        "  Findings: {}, Wave size: {}",
        findings.len(),
        wave_size.unwrap_or(config.wave_size)
    );
    println!("{}\n", "=".repeat(60));

    if dry_run {
        println!("  DRY RUN — showing what would be dispatched:\n");
        for wave in build_waves(findings, wave_size.unwrap_or(config.wave_size)) {
            println!("  Wave {}:", wave.wave_number);
            for session in &wave.sessions {
                let f = &session.finding;
                println!(
                    "    {} | {:30} | {:8} | {}",
                    f.finding_id,
                    f.category.as_str(),
                    f.severity.as_str(),
                    f.service_name
                );
            }
        }
        println!("\n{}\n", "=".repeat(60));
        return Ok(());
    }

    let mut options = RunOptions::new(&run_id);
    options.wave_size = wave_size;
    options.only_wave = only_wave;
    options.csv_filename =
        csv_filename.or_else(|| csv_path.file_name().map(|n| n.to_string_lossy().into_owned()));

    let run = supervisor::execute_run(config, findings, options).await?;
    print_run_summary(&run);
    Ok(())
}

fn print_run_summary(run: &BatchRun) {
    println!("\n{}", "=".repeat(60));
    println!(
        "  Run complete: {}/{} succeeded, {} PRs created",
        run.successful, run.total_findings, run.prs_created
    );
    println!("  Failed: {}, Status: {}", run.failed, run.status.as_str());
    for wave in &run.waves {
        let prs = wave.sessions.iter().filter(|s| s.pr_url.is_some()).count();
        println!(
            "    Wave {}: {}/{} success, {} failed, {} PRs",
            wave.wave_number,
            wave.success_count,
            wave.total_count(),
            wave.failure_count,
            prs
        );
    }
    println!("{}\n", "=".repeat(60));
}

fn cmd_status(config: &Config) -> Result<()> {
    let Some(run) = supervisor::load_latest_run(config)? else {
        println!("No active run found.");
        return Ok(());
    };

    let store = StateStore::new(&config.runs_dir, &config.state_file_path);
    let snapshot = ProgressTracker::new(run.clone(), store, None).snapshot();
    let pct = if snapshot.total_findings > 0 {
        snapshot.completed as f64 / snapshot.total_findings as f64 * 100.0
    } else {
        0.0
    };

    println!("\n{}", "=".repeat(60));
    println!("  Run Status");
    println!("{}", "=".repeat(60));
    println!("  Run ID:     {}", run.run_id);
    println!("  Status:     {}", run.status.as_str());
    println!("  Started:    {}", run.started_at);
    println!("\n  Completed:  {}/{} ({pct:.0}%)", snapshot.completed, snapshot.total_findings);
    println!("  Successful: {}", snapshot.successful);
    println!("  Failed:     {}", snapshot.failed);
    println!("  PRs:        {}", snapshot.prs_created);
    println!("\n  Waves:");
    for wave in &run.waves {
        let prs = wave.sessions.iter().filter(|s| s.pr_url.is_some()).count();
        println!(
            "    Wave {}: {}/{} success, {} failed, {} PRs",
            wave.wave_number,
            wave.success_count,
            wave.total_count(),
            wave.failure_count,
            prs
        );
    }
    println!("{}\n", "=".repeat(60));
    Ok(())
}

fn cmd_extract_memory(config: &Config, run_id: Option<String>) -> Result<()> {
    let store = StateStore::new(&config.runs_dir, &config.state_file_path);
    let run = match run_id {
        Some(id) => store.load_run_state(&id)?,
        None => store.latest_run()?,
    };
    let Some(run) = run else {
        println!("No runs found.");
        return Ok(());
    };

    let memory = MemoryStore::new(&config.memory_dir);
    let count = supervisor::save_run_memories(&run, &memory)?;
    if count == 0 {
        println!("No terminal sessions found — nothing to extract.");
        return Ok(());
    }

    println!("\n{}", "=".repeat(60));
    println!("  Memory Extraction Complete");
    println!("{}", "=".repeat(60));
    println!("  Run ID: {}", run.run_id);
    println!("  Items extracted: {count}");
    println!("  Graph entries: {}", memory.load_graph().entries.len());
    println!("{}\n", "=".repeat(60));
    Ok(())
}
