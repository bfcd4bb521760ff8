//! Runs the drift agent unattended, spooling change sets into the outbox.

use std::{
    io::BufRead,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use drift_agent::{
    config::{self, AgentConfig, ResolvedDirs},
    drift::{DriftManager, OutboxTransport, PassOutcome},
    logging::{self, LogSettings},
};
use tracing::{error, info};

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        error!(error = %err, "drift-agent stopped");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let Some(options) = parse_args(std::env::args().skip(1).collect())? else {
        return Ok(());
    };
    let config = match &options.config_path {
        Some(path) => config::load_from(path),
        None => config::load_or_default(),
    }
    .map_err(|err| err.to_string())?;

    let dirs = config::resolve_dirs(&config).map_err(|err| err.to_string())?;
    if let Err(err) = logging::init(&LogSettings::from_config(&config, &dirs)) {
        eprintln!("Logging disabled: {err}");
    }

    let manager = build_manager(&config, &dirs)?;
    let scheduled = manager
        .initialize(&config.resource_ids())
        .map_err(|err| err.to_string())?;
    if scheduled == 0 {
        info!("No drift definitions configured");
    }

    if options.once {
        run_once(&manager);
        return Ok(());
    }
    run_until_quit(&manager, &config)
}

fn build_manager(config: &AgentConfig, dirs: &ResolvedDirs) -> Result<Arc<DriftManager>, String> {
    let transport = Arc::new(OutboxTransport::new(
        &dirs.outbox_dir,
        &dirs.temp_dir,
        config.definitions_by_resource(),
    ));
    info!(
        data_dir = %dirs.data_dir.display(),
        outbox_dir = %dirs.outbox_dir.display(),
        "Starting drift agent"
    );
    DriftManager::new(&dirs.data_dir, &dirs.temp_dir, transport)
        .map(Arc::new)
        .map_err(|err| err.to_string())
}

/// Run every due schedule once on the current thread.
fn run_once(manager: &Arc<DriftManager>) {
    let detector = manager.detector();
    let mut passes = 0usize;
    loop {
        match detector.run_once(None) {
            PassOutcome::Idle => break,
            PassOutcome::Reported(summary) => {
                passes += 1;
                println!(
                    "{}:{} {} v{} ({} entries{})",
                    summary.resource_id(),
                    summary.definition_name(),
                    summary.category,
                    summary.version,
                    summary.entries.len(),
                    if summary.repeat { ", repeat" } else { "" }
                );
            }
            PassOutcome::Unchanged(key) => {
                passes += 1;
                println!("{key} unchanged");
            }
            PassOutcome::Skipped(key) => {
                passes += 1;
                println!("{key} disabled");
            }
            PassOutcome::Failed(key) => {
                passes += 1;
                println!("{key} failed; see log");
            }
        }
    }
    info!(passes, "Single detection round finished");
}

fn run_until_quit(manager: &Arc<DriftManager>, config: &AgentConfig) -> Result<(), String> {
    let pool = manager
        .start_detection(config.detector_threads, config.poll_interval())
        .map_err(|err| err.to_string())?;
    let quit = Arc::new(AtomicBool::new(false));
    let stdin_quit = Arc::clone(&quit);
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if matches!(line.trim(), "q" | "quit" | "exit") {
                stdin_quit.store(true, Ordering::Relaxed);
                break;
            }
        }
    });
    println!("drift-agent running; type 'quit' to stop");
    while !quit.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(200));
    }
    manager.shutdown(pool);
    Ok(())
}

#[derive(Debug, Clone, Default)]
struct CliOptions {
    config_path: Option<PathBuf>,
    once: bool,
}

fn parse_args(args: Vec<String>) -> Result<Option<CliOptions>, String> {
    let mut options = CliOptions::default();
    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => {
                println!("{}", help_text());
                return Ok(None);
            }
            "--config" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--config requires a value".to_string())?;
                options.config_path = Some(PathBuf::from(value));
            }
            "--once" => options.once = true,
            unknown => return Err(format!("Unknown argument: {unknown}\n\n{}", help_text())),
        }
        idx += 1;
    }
    Ok(Some(options))
}

fn help_text() -> String {
    [
        "drift-agent",
        "",
        "Usage:",
        "  drift-agent [--config <config.toml>] [--once]",
        "",
        "Options:",
        "  --config <path>  Read settings from <path> instead of the agent root",
        "  --once           Run every due detection once, then exit",
        "  -h, --help       Show this help",
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_config_and_once() {
        let options = parse_args(args(&["--config", "/tmp/a.toml", "--once"]))
            .unwrap()
            .unwrap();
        assert_eq!(options.config_path, Some(PathBuf::from("/tmp/a.toml")));
        assert!(options.once);
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse_args(args(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn rejects_unknown_and_missing_values() {
        assert!(parse_args(args(&["--bogus"])).is_err());
        assert!(parse_args(args(&["--config"])).is_err());
    }
}
