use anyhow::{anyhow, Context, Result};
use clap::Parser;
use colored::Colorize;
use env_logger::Builder;
use hunkmatch::{apply_hunk, discover_fixtures, evaluate_fixture, parse_hunk, MatchOptions};
use log::{info, warn, Level, LevelFilter};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

const DEFAULT_THRESHOLD: f32 = 0.8;
const DEFAULT_SLACK_LINES: usize = 1;

// --- Main Application Entry Point ---

fn main() {
    // 1. Parse command-line arguments using `clap`.
    let args = Args::parse();

    // 2. Set up the logger before any logic runs.
    setup_logging(&args);

    // 3. Call the main logic function; all error handling lives in `run`.
    if let Err(e) = run(args) {
        // Using {:?} ensures the full error chain from `anyhow` is printed.
        eprintln!("{} {:?}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Contains the primary logic of the application.
fn run(args: Args) -> Result<()> {
    // --- Argument Validation ---
    if !(0.0..=1.0).contains(&args.threshold) {
        return Err(anyhow!("Threshold must be between 0.0 and 1.0."));
    }

    let options = MatchOptions::builder()
        .threshold(args.threshold)
        .slack_lines(args.slack_lines)
        .build();

    match args.command {
        Command::Apply { file, hunk } => run_apply(&file, &hunk, &options),
        Command::Check { fixtures_dir } => run_check(&fixtures_dir, &options),
    }
}

/// Applies a single hunk file to a target file, writing the result in place.
fn run_apply(file: &PathBuf, hunk_path: &PathBuf, options: &MatchOptions) -> Result<()> {
    let original = fs::read_to_string(file)
        .with_context(|| format!("Failed to read target file '{}'", file.display()))?;
    let hunk_text = fs::read_to_string(hunk_path)
        .with_context(|| format!("Failed to read hunk file '{}'", hunk_path.display()))?;
    let hunk = parse_hunk(&hunk_text)
        .with_context(|| format!("Failed to parse hunk file '{}'", hunk_path.display()))?;

    info!(
        "Applying hunk to '{}' (threshold {:.2}, slack {}).",
        file.display(),
        options.threshold,
        options.slack_lines
    );

    let patched = apply_hunk(&original, &hunk, options)
        .with_context(|| format!("Refused to patch '{}'", file.display()))?;
    fs::write(file, patched)
        .with_context(|| format!("Failed to write patched file '{}'", file.display()))?;

    println!("{} {}", "patched".green().bold(), file.display());
    Ok(())
}

/// Runs every fixture under the given root and reports a verdict per case.
fn run_check(fixtures_dir: &PathBuf, options: &MatchOptions) -> Result<()> {
    if !fixtures_dir.is_dir() {
        return Err(anyhow!(
            "Fixtures directory '{}' not found or is not a directory.",
            fixtures_dir.display()
        ));
    }

    let cases = discover_fixtures(fixtures_dir)
        .with_context(|| format!("Failed to load fixtures from '{}'", fixtures_dir.display()))?;
    if cases.is_empty() {
        info!(
            "No fixtures found under '{}' (expected pass/ and fail/ subdirectories).",
            fixtures_dir.display()
        );
        return Ok(());
    }

    info!("Found {} fixture(s) to evaluate.", cases.len());
    info!(
        "Threshold: {:.2}, slack lines: {}.",
        options.threshold, options.slack_lines
    );

    let mut pass_count = 0;
    let mut fail_count = 0;

    for case in &cases {
        let report = evaluate_fixture(case, options);
        if report.passed {
            pass_count += 1;
            println!(
                "{} {} ({})",
                "PASS".green().bold(),
                report.name,
                report.detail
            );
        } else {
            fail_count += 1;
            println!(
                "{} {} ({})",
                "FAIL".red().bold(),
                report.name,
                report.detail
            );
        }
    }

    // --- Final Summary ---
    info!("");
    info!("--- Summary ---");
    info!("Passed: {}", pass_count);
    info!("Failed: {}", fail_count);

    if fail_count > 0 {
        warn!("Review the verdicts above for details.");
        // Return an error to set a non-zero exit code.
        return Err(anyhow!("Completed with {} failed fixture(s).", fail_count));
    }

    Ok(())
}

// --- Command-Line Interface ---

/// Defines the command-line arguments for the application.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Locate and apply context-anchored hunks by fuzzy matching, refusing ambiguous edits.",
    long_about = "Finds each hunk's location by its context instead of line numbers, tolerating \
                  whitespace drift, joined statements, and comment changes, and refuses to guess \
                  when more than one location ties."
)]
struct Args {
    #[command(subcommand)]
    command: Command,
    /// The minimum mean similarity for a window to qualify (0.0 to 1.0).
    /// Higher is stricter.
    #[arg(short = 't', long, default_value_t = DEFAULT_THRESHOLD, global = true, help = "Minimum window similarity to accept a match (0.0 to 1.0). Higher is stricter.")]
    threshold: f32,
    /// Maximum inserted or removed lines tolerated inside a matching window.
    #[arg(short = 's', long, default_value_t = DEFAULT_SLACK_LINES, global = true, help = "Maximum inserted/removed lines tolerated inside a matching window.")]
    slack_lines: usize,
    /// Increase logging verbosity. Can be used multiple times.
    /// -v for info, -vv for debug, -vvv for trace.
    #[arg(short, long, action = clap::ArgAction::Count, global = true, long_help = "Increase logging verbosity.\n-v for info, -vv for debug, -vvv for trace.")]
    verbose: u8,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Apply a hunk file to a target file in place.
    Apply {
        /// Path to the file to patch.
        file: PathBuf,
        /// Path to the hunk file (' ' context, '-' removed, '+' added,
        /// '@after:' insertion marker).
        hunk: PathBuf,
    },
    /// Evaluate the acceptance fixtures under a directory.
    Check {
        /// Path to the fixtures root (holding pass/ and fail/ directories).
        fixtures_dir: PathBuf,
    },
}

/// Sets up the global logger with a colored, level-prefixed format.
fn setup_logging(args: &Args) {
    let log_level = match args.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace, // -vvv and higher
    };

    Builder::new()
        .filter_level(log_level)
        .format(|buf, record| match record.level() {
            Level::Error => writeln!(buf, "{} {}", "error:".red().bold(), record.args()),
            Level::Warn => writeln!(buf, "{} {}", "warning:".yellow().bold(), record.args()),
            Level::Info => writeln!(buf, "{}", record.args()),
            Level::Debug => writeln!(buf, "{} {}", "debug:".blue().bold(), record.args()),
            Level::Trace => writeln!(buf, "{} {}", "trace:".cyan().bold(), record.args()),
        })
        .init();
}
