use std::process::ExitCode;

use clap::Parser;
use site_backup_lib::archive::ArchiveEngine;
use site_backup_lib::cli::{Cli, SummaryFormat};
use site_backup_lib::config::EngineConfig;
use site_backup_lib::orchestrator::{log_sites, BackupMode, LocalBackup, RemoteBackup, Summary};
use site_backup_lib::remote::Session;
use site_backup_lib::sites::{self, LocalConfig};
use site_backup_lib::util::artifact::BackupLayout;

fn main() -> ExitCode {
    // before parsing, the variables may fill in arguments
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    if let Err(e) = env_logger.try_init() {
        eprintln!("Initializing the logger failed: {e}");
    }

    if let Err(e) = dotenv {
        log::warn!("No .env file loaded, using the environment only: {e}");
    }

    let config = match EngineConfig::load_or_init(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    let engine = config.archive.engine();

    let mut summaries = Vec::new();
    if cli.skip_local {
        log::info!("Skipping the local backup");
    } else {
        summaries.push(local_backup(&cli, &config, engine.clone()));
    }
    if cli.remote.enabled {
        summaries.push(remote_backup(&cli, &config, &engine));
    }

    for summary in &summaries {
        summary.log();
    }
    if cli.summary == SummaryFormat::Json {
        match serde_json::to_string_pretty(&summaries) {
            Ok(json) => println!("{json}"),
            Err(e) => log::error!("Serializing the summary failed: {e}"),
        }
    }

    if summaries.iter().all(Summary::is_success) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn local_backup(cli: &Cli, config: &EngineConfig, engine: ArchiveEngine) -> Summary {
    log::info!("Starting local backups");

    let config_paths = if cli.apache_config.is_empty() {
        config.local.config_paths.clone()
    } else {
        cli.apache_config.clone()
    };
    let sites = match sites::discover(&LocalConfig::new(config_paths)) {
        Ok(sites) => sites,
        Err(e) => return Summary::aborted(BackupMode::Local, e),
    };
    log_sites(BackupMode::Local, &sites);

    let backup_root = cli.local_backup_root.as_ref().unwrap_or(&config.local.backup_root);
    let backup = LocalBackup::new(
        BackupLayout::new(backup_root),
        engine,
        config.database.dumper(config.archive.compression_level),
        cli.retention.local(config.local.retention),
    );
    Summary::new(BackupMode::Local, backup.run(&sites))
}

fn remote_backup(cli: &Cli, config: &EngineConfig, engine: &ArchiveEngine) -> Summary {
    log::info!("Starting remote backups");

    let remote_config = match cli.remote.remote_config(&config.remote) {
        Ok(remote_config) => remote_config,
        Err(e) => return Summary::aborted(BackupMode::Remote, e),
    };
    let session = match Session::open(&remote_config) {
        Ok(session) => session,
        Err(e) => return Summary::aborted(BackupMode::Remote, e),
    };

    let backup_root = cli.remote_backup_root.as_ref().unwrap_or(&config.remote.backup_root);
    let backup = RemoteBackup::new(
        &session,
        BackupLayout::new(backup_root),
        engine,
        cli.remote.transfer(&config.remote),
        cli.retention.remote(config.remote.retention),
    );
    let summary = match backup.discover(config.remote.config_dirs.clone()) {
        Ok(sites) => Summary::new(BackupMode::Remote, backup.run(&sites)),
        Err(e) => Summary::aborted(BackupMode::Remote, e),
    };

    session.close();
    summary
}
