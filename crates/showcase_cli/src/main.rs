//! CLI smoke entry point.
//!
//! # Responsibility
//! - Provide a minimal executable to verify `showcase_core` linkage.
//! - Optionally inspect an existing catalog: list projects and the
//!   pending-cleanup ledger, or retry the ledger.
//!
//! Usage: `showcase_cli [config.json] [--retry-cleanup]`

use log::info;
use showcase_core::{
    init_logging_from_config, CatalogConfig, ProjectRepository, ProjectService, StaticAccessGate,
};
use std::process::ExitCode;

fn main() -> ExitCode {
    println!("showcase_core ping={}", showcase_core::ping());
    println!("showcase_core version={}", showcase_core::core_version());

    let mut args = std::env::args().skip(1);
    let Some(config_path) = args.next() else {
        return ExitCode::SUCCESS;
    };
    let retry = args.any(|arg| arg == "--retry-cleanup");

    match inspect(&config_path, retry) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}

fn inspect(config_path: &str, retry: bool) -> Result<(), String> {
    let config = CatalogConfig::load(config_path).map_err(|err| err.to_string())?;
    init_logging_from_config(&config)?;
    info!(
        "event=cli_inspect module=cli status=start db_path={}",
        config.db_path.display()
    );

    let service = ProjectService::open(&config, Box::new(StaticAccessGate::new()))
        .map_err(|err| err.to_string())?;

    for project in service.list_projects().map_err(|err| err.to_string())? {
        let responsible = project
            .responsible_member()
            .map_or("-", |member| member.name.as_str());
        println!(
            "project id={} version={} title={:?} members={} responsible={:?} gallery={}",
            project.id,
            project.version,
            project.title,
            project.members.len(),
            responsible,
            project.gallery.len()
        );
    }

    if retry {
        let report = service
            .retry_pending_cleanup()
            .map_err(|err| err.to_string())?;
        println!(
            "cleanup deleted={} missing={} escalated={}",
            report.deleted.len(),
            report.already_missing.len(),
            report.escalated.len()
        );
    }

    let pending = service
        .repository()
        .list_pending_cleanup()
        .map_err(|err| err.to_string())?;
    for entry in &pending {
        println!(
            "pending ref={} attempts={} reason={:?}",
            entry.attachment, entry.attempts, entry.reason
        );
    }
    Ok(())
}
