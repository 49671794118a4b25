use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use coevolve::config::{self, ProjectConfig};
use coevolve::generator::CommandGenerator;
use coevolve::output;
use coevolve::runner::ProcessRunner;
use coevolve::sandbox::SandboxManager;
use coevolve::schedule::{
    BatchScheduler, CoverageFirstSelection, FifoSelection, SelectionStrategy,
};
use coevolve::state;
use coevolve::store::{MemoryStore, Store};
use coevolve::target::TargetCoordinator;

#[derive(Parser)]
#[command(name = "coevolve", version, about = "Co-evolve test suites and code mutants")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the co-evolution loop against a project
    Run {
        /// Project root directory
        project: PathBuf,
        /// Config file (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Output JSON instead of human-readable text
        #[arg(long)]
        json: bool,
        /// Exit code only, no output
        #[arg(short, long)]
        quiet: bool,
        /// Mutate the project tree directly instead of an isolated copy
        #[arg(long)]
        in_place: bool,
        /// Session ID for isolation (default: auto-generated)
        #[arg(long)]
        session: Option<String>,
        /// Target selection strategy: fifo or coverage
        #[arg(long, default_value = "fifo")]
        strategy: String,
        /// Override the configured iteration ceiling
        #[arg(long)]
        iterations: Option<u32>,
        /// State snapshot file (default: .coevolve-state.json in CWD)
        #[arg(long)]
        state_file: Option<PathBuf>,
        /// Skip writing accepted test files back to the project
        #[arg(long)]
        no_write: bool,
    },
    /// Resume an interrupted run from its state snapshot
    Resume {
        /// Project root directory
        project: PathBuf,
        /// Config file (JSON)
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
        #[arg(short, long)]
        quiet: bool,
        #[arg(long)]
        in_place: bool,
        #[arg(long)]
        session: Option<String>,
        #[arg(long, default_value = "fifo")]
        strategy: String,
        #[arg(long)]
        state_file: Option<PathBuf>,
        #[arg(long)]
        no_write: bool,
    },
    /// Summary of the last run
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Run {
            project,
            config,
            json,
            quiet,
            in_place,
            session,
            strategy,
            iterations,
            state_file,
            no_write,
        } => cmd_run(
            project, config, json, quiet, in_place, session, strategy, iterations, state_file,
            no_write, false,
        ),
        Commands::Resume {
            project,
            config,
            json,
            quiet,
            in_place,
            session,
            strategy,
            state_file,
            no_write,
        } => cmd_run(
            project, config, json, quiet, in_place, session, strategy, None, state_file, no_write,
            true,
        ),
        Commands::Status { json, state_file } => cmd_status(json, state_file),
    };
    process::exit(exit_code);
}

fn generate_session_id() -> String {
    format!("{:08x}", fastrand::u32(..))
}

fn pick_strategy(name: &str) -> Option<Box<dyn SelectionStrategy>> {
    match name {
        "fifo" => Some(Box::new(FifoSelection)),
        "coverage" => Some(Box::new(CoverageFirstSelection)),
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    project: PathBuf,
    config_path: PathBuf,
    json_mode: bool,
    quiet: bool,
    in_place: bool,
    session: Option<String>,
    strategy_name: String,
    iterations: Option<u32>,
    state_file: Option<PathBuf>,
    no_write: bool,
    resume: bool,
) -> i32 {
    if !project.is_dir() {
        output::print_error(&format!(
            "Project directory not found: {}. Check the path and try again.",
            project.display()
        ));
        return 2;
    }
    let mut cfg: ProjectConfig = match config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            output::print_error(&format!("Failed to load config: {}", e));
            return 2;
        }
    };
    if let Some(n) = iterations {
        cfg.engine.max_iterations = n;
    }
    let Some(strategy) = pick_strategy(&strategy_name) else {
        output::print_error(&format!(
            "Unknown strategy '{}'. Supported: fifo, coverage",
            strategy_name
        ));
        return 2;
    };

    let session_id = session.unwrap_or_else(generate_session_id);
    let scratch = match tempfile::Builder::new()
        .prefix(&format!("coevolve-{}-", session_id))
        .tempdir()
    {
        Ok(d) => d,
        Err(e) => {
            output::print_error(&format!("Failed to create scratch directory: {}", e));
            return 3;
        }
    };
    let sandboxes = Arc::new(SandboxManager::new(scratch.path()));

    // Default: work on an isolated copy so the original tree is never
    // touched until accepted tests are written back at the end.
    let workspace = if in_place {
        project.clone()
    } else {
        match sandboxes.create(&project, &format!("workspace-{}", session_id)) {
            Ok(p) => p,
            Err(e) => {
                output::print_error(&format!("Failed to set up isolated workspace: {}", e));
                return 3;
            }
        }
    };

    let runner = Arc::new(ProcessRunner {
        compile_cmd: cfg.runner.compile_cmd.clone(),
        test_cmd: cfg.runner.test_cmd.clone(),
        coverage_cmd: cfg.runner.coverage_cmd.clone(),
        report_file: PathBuf::from(&cfg.runner.report_file),
        coverage_file: PathBuf::from(&cfg.runner.coverage_file),
        timeout_ms: cfg.runner.timeout_ms,
    });
    let generator = Arc::new(CommandGenerator {
        cmd: cfg.generator_cmd.clone(),
        timeout_ms: cfg.generator_timeout_ms,
    });
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    for (class, file) in &cfg.class_files {
        if let Err(e) = store.map_class_file(class, file) {
            output::print_error(&format!("Failed to seed class mapping: {}", e));
            return 3;
        }
    }
    let coordinator = Arc::new(TargetCoordinator::new());

    let mut scheduler = BatchScheduler::new(
        Arc::clone(&sandboxes),
        runner,
        generator,
        Arc::clone(&store),
        Arc::clone(&coordinator),
        strategy,
        cfg.engine.clone(),
        cfg.language,
        cfg.targets.clone(),
    );
    let state_path = state_file.unwrap_or_else(state::default_state_path);
    scheduler.snapshot_path = Some(state_path.clone());

    if resume {
        match state::load_from_path(&state_path) {
            Some(snapshot) => scheduler.restore(snapshot),
            None => {
                output::print_error(&format!(
                    "No resumable state at {}. Run `coevolve run` first.",
                    state_path.display()
                ));
                return 2;
            }
        }
    }

    let summary = match scheduler.run(&workspace) {
        Ok(s) => s,
        Err(e) => {
            output::print_error(&format!("Run failed: {}", e));
            return 3;
        }
    };

    // Accepted test files live in the store; write them back to the real
    // project unless asked not to.
    if !no_write && !in_place {
        match store.all_files() {
            Ok(files) => {
                for (rel, content) in files {
                    let dest = project.join(&rel);
                    if let Some(parent) = dest.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    if let Err(e) = std::fs::write(&dest, content) {
                        output::print_error(&format!("Failed to write {}: {}", rel, e));
                    }
                }
            }
            Err(e) => output::print_error(&format!("Failed to read accepted files: {}", e)),
        }
    }

    let survived = summary.state.mutants_survived;
    if quiet {
        return if survived > 0 { 1 } else { 0 };
    }
    if json_mode {
        match serde_json::to_string(&summary.state) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                output::print_error(&format!("Failed to encode summary: {}", e));
                return 3;
            }
        }
    } else {
        output::print_run_summary(&summary, &coordinator.blacklist_snapshot());
    }
    if survived > 0 { 1 } else { 0 }
}

fn cmd_status(json_mode: bool, state_file: Option<PathBuf>) -> i32 {
    let path = state_file.unwrap_or_else(state::default_state_path);
    match state::load_from_path(&path) {
        Some(snapshot) => {
            if json_mode {
                match serde_json::to_string(&snapshot.state) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        output::print_error(&format!("Failed to encode state: {}", e));
                        return 3;
                    }
                }
            } else {
                output::print_status(&snapshot.state);
            }
            0
        }
        None => {
            output::print_error("No previous run found. Run `coevolve run` first.");
            2
        }
    }
}
