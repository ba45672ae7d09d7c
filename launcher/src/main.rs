//! `launcher`: run a program with its channels bound per a JSON manifest.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::warn;

use launcher::exit_codes;
use launcher::io::config::{LauncherConfig, load_config, write_config};
use launcher::io::manifest_store::load_manifest;
use launcher::{LaunchOptions, LaunchOutcome, launch, logging};

const DEFAULT_CONFIG: &str = "launcher.toml";

#[derive(Parser)]
#[command(
    name = "launcher",
    version,
    about = "Launch a program with its I/O channels and parameters bound at launch time"
)]
struct Cli {
    /// Log launcher debug events (descriptor plans, pumps) to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve the manifest's bindings, run the program, exit with its code.
    Run {
        /// Path to the JSON launch manifest.
        manifest: PathBuf,
        /// Launcher config (TOML). Missing file means defaults.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Kill the program after this many seconds (overrides config).
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Write captured side channels here as `fd<N>.out`.
        #[arg(long)]
        capture_dir: Option<PathBuf>,
    },
    /// Check a manifest against the schema and binding invariants.
    Validate {
        manifest: PathBuf,
    },
    /// Write the default launcher config.
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let code = match cli.command {
        Command::Run {
            manifest,
            config,
            timeout_secs,
            capture_dir,
        } => cmd_run(&manifest, &config, timeout_secs, capture_dir.as_deref()),
        Command::Validate { manifest } => report(cmd_validate(&manifest)),
        Command::InitConfig { path, force } => report(cmd_init_config(&path, force)),
    };
    std::process::exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => exit_codes::OK,
        Err(err) => fail(&err, exit_codes::WRAPPER_FAILURE),
    }
}

fn fail(err: &anyhow::Error, code: i32) -> i32 {
    eprintln!("launcher: {err:#}");
    code
}

fn cmd_run(
    manifest: &Path,
    config: &Path,
    timeout_secs: Option<u64>,
    capture_dir: Option<&Path>,
) -> i32 {
    let cfg = match load_config(config) {
        Ok(cfg) => cfg,
        Err(err) => return fail(&err, exit_codes::WRAPPER_FAILURE),
    };
    match run_manifest(manifest, &cfg, timeout_secs, capture_dir) {
        Ok(outcome) => outcome.exit_code(),
        Err(err) => fail(&err, cfg.wrapper_exit_code),
    }
}

fn run_manifest(
    manifest: &Path,
    cfg: &LauncherConfig,
    timeout_secs: Option<u64>,
    capture_dir: Option<&Path>,
) -> Result<LaunchOutcome> {
    let manifest = load_manifest(manifest)?;
    let mut options = LaunchOptions::from_config(cfg);
    if let Some(secs) = timeout_secs {
        options.timeout = Some(Duration::from_secs(secs));
    }

    let outcome = launch(&manifest, &options)
        .with_context(|| format!("launch {}", manifest.program().display()))?;
    if outcome.timed_out {
        warn!(pid = outcome.pid, "program was killed after timing out");
    }
    if let Some(dir) = capture_dir {
        write_captures(dir, &outcome)?;
    }
    Ok(outcome)
}

fn write_captures(dir: &Path, outcome: &LaunchOutcome) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    for (fd, captured) in &outcome.captured {
        let path = dir.join(format!("fd{fd}.out"));
        fs::write(&path, &captured.bytes).with_context(|| format!("write {}", path.display()))?;
        if captured.truncated > 0 {
            warn!(fd, truncated = captured.truncated, "captured output was truncated");
        }
    }
    Ok(())
}

fn cmd_validate(manifest: &Path) -> Result<()> {
    let manifest = load_manifest(manifest)?;
    println!(
        "ok: {} binding(s) for {}",
        manifest.bindings().len(),
        manifest.program().display()
    );
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &LauncherConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from([
            "launcher",
            "run",
            "launch.json",
            "--timeout-secs",
            "5",
            "--capture-dir",
            "out",
        ]);
        match cli.command {
            Command::Run {
                manifest,
                config,
                timeout_secs,
                capture_dir,
            } => {
                assert_eq!(manifest, PathBuf::from("launch.json"));
                assert_eq!(config, PathBuf::from(DEFAULT_CONFIG));
                assert_eq!(timeout_secs, Some(5));
                assert_eq!(capture_dir, Some(PathBuf::from("out")));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn parse_init_config_force() {
        let cli = Cli::parse_from(["launcher", "init-config", "--force"]);
        assert!(matches!(cli.command, Command::InitConfig { force: true, .. }));
        assert!(!cli.verbose);

        let cli = Cli::parse_from(["launcher", "validate", "launch.json", "-v"]);
        assert!(cli.verbose);
    }
}
