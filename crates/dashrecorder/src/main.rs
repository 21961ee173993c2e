//! `dashrec` - CLI for dashrecorder
//!
//! This binary runs the recording pipeline in the foreground and provides
//! the operator commands for inspecting, verifying and managing segments.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::info;

use dashrecorder::cli::{
    Cli, Command, ConfigCommand, EnforceCommand, ListCommand, OutputFormat, PreserveCommand,
    PurgeCommand, RunCommand, StatusCommand, VerifyCommand,
};
use dashrecorder::retention::{RetentionLimits, SpaceProbe, VolumeSpaceProbe};
use dashrecorder::{
    init_logging, Config, Daemon, IntegrityLedger, RetentionPolicy, SegmentStore, ShutdownSignal,
    StoreOptions, Verification,
};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.verbosity());

    // Validating a file must not depend on the default one loading
    if let Command::Config(ConfigCommand::Validate { file }) = &cli.command {
        return handle_validate(file.clone().or_else(|| cli.config.clone()));
    }

    let config = Config::load_from(cli.config.clone())?;

    match cli.command {
        Command::Run(cmd) => handle_run(config, &cmd),
        Command::Status(cmd) => handle_status(&config, &cmd),
        Command::List(cmd) => handle_list(&config, &cmd),
        Command::Verify(cmd) => handle_verify(&config, &cmd),
        Command::Preserve(cmd) => handle_preserve(&config, &cmd),
        Command::Purge(cmd) => handle_purge(&config, &cmd),
        Command::Enforce(cmd) => handle_enforce(&config, &cmd),
        Command::Config(cmd) => handle_config(&config, cmd),
    }
}

/// Open the store for reading while a daemon may be writing to it.
fn open_read_only(config: &Config) -> Result<Arc<SegmentStore>> {
    let store = SegmentStore::open(
        config.video_dir(),
        StoreOptions::read_only(config.storage.segment_extension.clone()),
    )
    .with_context(|| format!("failed to read {}", config.video_dir().display()))?;
    Ok(Arc::new(store))
}

/// Open the store as its single writer.
fn open_writable(config: &Config) -> Result<Arc<SegmentStore>> {
    let options = StoreOptions {
        extension: config.storage.segment_extension.clone(),
        ..StoreOptions::default()
    };
    match SegmentStore::open(config.video_dir(), options) {
        Ok(store) => Ok(Arc::new(store)),
        Err(e) if e.is_locked() => bail!(
            "{} is in use by a running recorder; stop it first",
            config.video_dir().display()
        ),
        Err(e) => {
            Err(e).with_context(|| format!("failed to open {}", config.video_dir().display()))
        }
    }
}

fn free_ratio(config: &Config) -> Option<f64> {
    VolumeSpaceProbe::new(config.video_dir()).free_ratio().ok()
}

fn handle_run(mut config: Config, cmd: &RunCommand) -> Result<()> {
    if cmd.no_upload {
        config.upload.enabled = false;
    }

    let daemon = match Daemon::from_config(&config) {
        Ok(daemon) => daemon,
        Err(e) if e.is_locked() => bail!(
            "another recorder is already running on {}",
            config.video_dir().display()
        ),
        Err(e) => return Err(e.into()),
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(async move {
        let shutdown = ShutdownSignal::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, stopping");
                signal.trigger();
            }
        });

        daemon.run(shutdown).await;
    });
    Ok(())
}

fn handle_status(config: &Config, cmd: &StatusCommand) -> Result<()> {
    let store = open_read_only(config)?;
    let ledger = IntegrityLedger::open(config.ledger_path(), Arc::clone(&store));
    let stats = store.stats();
    let free = free_ratio(config);

    if cmd.json {
        let status = serde_json::json!({
            "video_dir": store.dir(),
            "segments": stats,
            "free_ratio": free,
            "min_free_ratio": config.retention.min_free_ratio,
            "ledger_path": ledger.path(),
            "ledger_entries": ledger.len(),
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        println!("dashrec status");
        println!("--------------");
        println!("Videos:        {}", store.dir().display());
        println!("Recording:     {}", stats.active);
        println!("Normal:        {}", stats.normal);
        println!("Preserved:     {}", stats.preserved);
        println!("Bytes used:    {}", stats.total_bytes);
        match free {
            Some(ratio) => println!(
                "Free space:    {:.1}% (minimum {:.1}%)",
                ratio * 100.0,
                config.retention.min_free_ratio * 100.0
            ),
            None => println!("Free space:    unknown"),
        }
        println!("Ledger:        {} ({} entries)", ledger.path().display(), ledger.len());
    }
    Ok(())
}

fn handle_list(config: &Config, cmd: &ListCommand) -> Result<()> {
    let store = open_read_only(config)?;
    let segments: Vec<_> = store
        .list_segments()
        .into_iter()
        .filter(|segment| !cmd.preserved || segment.is_preserved())
        .collect();

    match cmd.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&segments)?),
        OutputFormat::Plain => {
            for segment in &segments {
                println!("{}", segment.path.display());
            }
        }
        OutputFormat::Table => {
            println!(
                "{:<20} {:<10} {:<20} {:>12}  FINGERPRINT",
                "NAME", "STATE", "CREATED", "BYTES"
            );
            for segment in &segments {
                println!(
                    "{:<20} {:<10} {:<20} {:>12}  {}",
                    segment.name,
                    segment.state.to_string(),
                    segment.created_at.format("%Y-%m-%d %H:%M:%S"),
                    segment.size_bytes,
                    segment
                        .fingerprint
                        .map_or_else(|| "-".to_string(), |f| f.short()),
                );
            }
            println!();
            println!("{} segment(s)", segments.len());
        }
    }
    Ok(())
}

fn handle_verify(config: &Config, cmd: &VerifyCommand) -> Result<()> {
    let store = open_read_only(config)?;
    let ledger = IntegrityLedger::open(config.ledger_path(), store);

    let results = match &cmd.name {
        Some(name) => vec![(name.clone(), ledger.verify(name)?)],
        None => ledger.verify_all()?,
    };

    if cmd.json {
        let report: Vec<_> = results
            .iter()
            .map(|(name, verification)| match verification {
                Verification::Tampered { expected, actual } => serde_json::json!({
                    "name": name,
                    "result": verification.label(),
                    "expected": expected,
                    "actual": actual,
                }),
                _ => serde_json::json!({ "name": name, "result": verification.label() }),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for (name, verification) in &results {
            println!("{name:<20} {verification}");
        }
    }

    let tampered = results
        .iter()
        .filter(|(_, v)| matches!(v, Verification::Tampered { .. }))
        .count();
    if tampered > 0 {
        bail!("{tampered} segment(s) failed verification");
    }
    Ok(())
}

fn handle_preserve(config: &Config, cmd: &PreserveCommand) -> Result<()> {
    let store = open_writable(config)?;
    let preserved = match &cmd.name {
        Some(name) => Some(store.preserve(name)?),
        None => store.preserve_most_recent_completed()?,
    };

    match preserved {
        Some(segment) => println!("Preserved {}", segment.path.display()),
        None => println!("No completed segment to preserve."),
    }
    Ok(())
}

fn handle_purge(config: &Config, cmd: &PurgeCommand) -> Result<()> {
    if !cmd.yes {
        println!("This will permanently delete segment {}.", cmd.name);
        println!("Use --yes to confirm.");
        return Ok(());
    }

    let store = open_writable(config)?;
    let ledger = IntegrityLedger::open(config.ledger_path(), Arc::clone(&store));
    let segment = store.purge(&cmd.name)?;
    ledger.remove(&cmd.name)?;
    println!("Deleted {}", segment.path.display());
    Ok(())
}

fn handle_enforce(config: &Config, cmd: &EnforceCommand) -> Result<()> {
    config.validate()?;
    let store = open_writable(config)?;
    let ledger = Arc::new(IntegrityLedger::open(config.ledger_path(), Arc::clone(&store)));
    let policy = RetentionPolicy::new(
        Arc::clone(&store),
        Box::new(VolumeSpaceProbe::new(store.dir())),
        RetentionLimits::from(&config.retention),
    )
    .with_ledger(ledger);

    let report = policy.enforce();
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Evicted:   {}", report.evicted.len());
        for name in &report.evicted {
            println!("  {name}");
        }
        if !report.skipped.is_empty() {
            println!("Skipped:   {}", report.skipped.join(", "));
        }
        if !report.failed.is_empty() {
            println!("Failed:    {}", report.failed.join(", "));
        }
        if let Some(ratio) = report.free_ratio {
            println!("Free:      {:.1}%", ratio * 100.0);
        }
        if let Some(critical) = &report.critical {
            println!("CRITICAL:  {critical}");
        }
    }
    Ok(())
}

fn handle_validate(file: Option<std::path::PathBuf>) -> Result<()> {
    let path = file.unwrap_or_else(Config::default_config_path);
    println!("Validating configuration: {}", path.display());
    match Config::load_from(Some(path)) {
        Ok(_) => {
            println!("Configuration is valid.");
            Ok(())
        }
        Err(e) => bail!("configuration error: {e}"),
    }
}

fn handle_config(config: &Config, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("Current Configuration");
                println!("=====================");
                println!();
                println!("[Storage]");
                println!("  Video directory:    {}", config.video_dir().display());
                println!("  Ledger:             {}", config.ledger_path().display());
                println!("  Extension:          {}", config.storage.segment_extension);
                println!();
                println!("[Recording]");
                println!(
                    "  Segment duration:   {}s",
                    config.recording.segment_duration_secs
                );
                println!("  Device:             {}", config.recording.device);
                println!(
                    "  Resolution:         {}x{}",
                    config.recording.width, config.recording.height
                );
                println!();
                println!("[Retention]");
                println!(
                    "  Max normal:         {}",
                    config.retention.max_normal_segments
                );
                println!("  Min free ratio:     {}", config.retention.min_free_ratio);
                println!("  Floor segments:     {}", config.retention.floor_segments);
                println!();
                println!("[Crash]");
                println!("  Threshold (g):      {}", config.crash.threshold_g);
                println!("  Cooldown (ms):      {}", config.crash.cooldown_ms);
                println!();
                println!("[Upload]");
                println!("  Enabled:            {}", config.upload.enabled);
                println!("  Interval (s):       {}", config.upload.interval_secs);
                println!("  Command:            {}", config.upload.command.join(" "));
            }
        }
        ConfigCommand::Path => {
            println!("{}", Config::default_config_path().display());
        }
        ConfigCommand::Validate { file } => handle_validate(file)?,
    }
    Ok(())
}
