use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use switchboard_lib::active::get_active_profile;
use switchboard_lib::migrate::MigrationReport;
use switchboard_lib::orchestrator::{
    self, SwitchEnvironment, SwitchEvent, SwitchRequest, SwitchStep, SwitchStepState,
    SwitchSummary,
};
use switchboard_lib::probe::{ProbeReport, SchemaReport};
use switchboard_lib::profile::ProfileId;
use switchboard_lib::settings::SettingsMap;
use switchboard_lib::txn::{SwitchStatus, SwitchTransaction, TxnJournal};

#[derive(Debug, Parser)]
#[command(name = "switchboard", about = "Backend switchboard for the content platform", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Switch the platform to another backend profile.
    Switch {
        /// Target profile: firebase, sqlite or mysql.
        profile: String,
        /// Override a configuration setting, e.g. --set MYSQL_HOST=db:3306.
        /// May be repeated; unset keys fall back to the environment and the
        /// current configuration artifact.
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        /// Emit the final switch summary as JSON instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Show the active profile and recent switch transactions.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Restore entry files and configuration from a journaled transaction.
    Rollback {
        /// Transaction id to unwind; defaults to the most recent one.
        transaction_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Probe a profile's backend without changing anything.
    Validate {
        /// Profile to probe: firebase, sqlite or mysql.
        profile: String,
        #[arg(long = "set", value_name = "KEY=VALUE")]
        set: Vec<String>,
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    switchboard_lib::init_logging();

    let cli = Cli::parse();
    match handle_cli(cli.command).await {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

async fn handle_cli(command: Commands) -> Result<i32> {
    match command {
        Commands::Switch { profile, set, json } => handle_switch(&profile, &set, json).await,
        Commands::Status { json } => handle_status(json).await,
        Commands::Rollback {
            transaction_id,
            json,
        } => handle_rollback(transaction_id.as_deref(), json).await,
        Commands::Validate { profile, set, json } => handle_validate(&profile, &set, json).await,
    }
}

fn parse_overrides(pairs: &[String]) -> Result<SettingsMap> {
    let mut map = SettingsMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("--set expects KEY=VALUE, got {pair:?}"))?;
        map.insert(key.trim().to_string(), value.to_string());
    }
    Ok(map)
}

async fn handle_switch(profile: &str, set: &[String], emit_json: bool) -> Result<i32> {
    let target: ProfileId = profile.parse().map_err(anyhow::Error::from)?;
    let overrides = parse_overrides(set)?;
    let env = SwitchEnvironment::from_system()?;
    let request = SwitchRequest { target, overrides };

    let observer: Option<Arc<dyn Fn(SwitchEvent) + Send + Sync>> = if emit_json {
        None
    } else {
        Some(Arc::new(|event| match event {
            SwitchEvent::Step {
                step,
                status,
                message,
            } => {
                let label = step_label(&step);
                let status_label = step_state_label(&status);
                if let Some(msg) = message {
                    println!("{label:<14} {status_label:<9} {msg}");
                } else {
                    println!("{label:<14} {status_label:<9}");
                }
            }
        }))
    };

    let summary = orchestrator::run_switch(&env, &request, observer).await?;

    if emit_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_switch_summary(&env, &summary);
    }
    Ok(if summary.success { 0 } else { 1 })
}

fn print_switch_summary(env: &SwitchEnvironment, summary: &SwitchSummary) {
    println!();
    if summary.success {
        println!(
            "Switch complete. Active profile is now {}.",
            summary.target_profile
        );
    } else {
        match summary.final_status {
            SwitchStatus::RolledBack => println!(
                "Switch failed and was rolled back. Active profile remains {}.",
                summary.source_profile
            ),
            SwitchStatus::Failed => {
                println!("Switch failed AND rollback did not complete.");
                println!(
                    "Manual recovery: restore the entry files listed below from \
                     their .bak copies, then run `switchboard validate {}`.",
                    summary.source_profile
                );
            }
            other => println!("Switch stopped in state {other}."),
        }
        if let Some(error) = &summary.error {
            println!("Reason: {} ({})", error.message(), error.code());
        }
    }

    if let Some(migration) = &summary.migration {
        print_migration_table(migration);
    }

    // The journal carries the file-level detail the summary does not.
    let journal = TxnJournal::new(&env.data_dir);
    if let Ok(txn) = journal.load(&summary.txn_id) {
        if let Some(manifest) = &txn.manifest {
            println!("\nEntry files:");
            for entry in &manifest.entries {
                println!("  {}  (backup: {})", entry.original_path, entry.backup_path);
            }
        }
    }

    println!("\nTransaction : {}", summary.txn_id);
    println!("Final state : {}", summary.final_status);
    if summary.duration_ms > 0 {
        println!(
            "Elapsed     : {:.2} seconds",
            summary.duration_ms as f64 / 1000.0
        );
    }
}

fn print_migration_table(report: &MigrationReport) {
    println!("\nMigration:");
    println!(
        "{:<14} {:>8} {:>8} {:>9} {:>7}  State",
        "Table", "Read", "Written", "Unchanged", "Errors"
    );
    for table in &report.tables {
        let state = if table.aborted { "aborted" } else { "ok" };
        println!(
            "{:<14} {:>8} {:>8} {:>9} {:>7}  {}",
            table.entity.table(),
            table.stats.rows_read,
            table.stats.rows_written,
            table.stats.rows_skipped,
            table.stats.error_count,
            state
        );
        for sample in &table.error_samples {
            println!("  - {sample}");
        }
    }
}

async fn handle_status(emit_json: bool) -> Result<i32> {
    let env = SwitchEnvironment::from_system()?;
    let active = get_active_profile(&env.active)?;
    let journal = TxnJournal::new(&env.data_dir);
    let transactions = journal.list()?;

    if emit_json {
        let payload = json!({
            "active": active,
            "transactions": transactions,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }

    println!("Active profile : {}", active.profile);
    if let Some(txn_id) = &active.txn_id {
        println!("Committed by   : {txn_id}");
    }

    if transactions.is_empty() {
        println!("\nNo switch transactions recorded.");
    } else {
        println!("\nTransactions (newest first):");
        println!(
            "{:<38} {:<10} {:<10} {:<17} Updated",
            "Id", "From", "To", "Status"
        );
        for txn in &transactions {
            println!(
                "{:<38} {:<10} {:<10} {:<17} {}",
                txn.id, txn.source_profile, txn.target_profile, txn.status, txn.updated_at
            );
        }
    }

    let unfinished = journal.unfinished()?;
    if !unfinished.is_empty() {
        println!(
            "\nWarning: {} unfinished transaction(s). Run `switchboard rollback <id>` \
             to restore the entry files.",
            unfinished.len()
        );
    }
    Ok(0)
}

async fn handle_rollback(transaction_id: Option<&str>, emit_json: bool) -> Result<i32> {
    let env = SwitchEnvironment::from_system()?;
    match orchestrator::run_rollback(&env, transaction_id).await {
        Ok(txn) => {
            if emit_json {
                println!("{}", serde_json::to_string_pretty(&txn)?);
            } else {
                print_rollback_result(&txn);
            }
            Ok(0)
        }
        Err(err) => {
            if err.code() == "SWAP/ROLLBACK_INCOMPLETE" {
                eprintln!("Error: {} ({})", err.message(), err.code());
                eprintln!(
                    "Manual recovery required: a backup file is missing or altered. \
                     Restore the affected entry file from the path in the error \
                     context, then re-run the rollback."
                );
                return Ok(1);
            }
            Err(err.into())
        }
    }
}

fn print_rollback_result(txn: &SwitchTransaction) {
    println!("Rolled back transaction {}.", txn.id);
    println!("Entry files restored to the {} profile.", txn.source_profile);
    if let Some(manifest) = &txn.manifest {
        println!("\nRestored files:");
        for entry in &manifest.entries {
            println!("  {}", entry.original_path);
        }
    }
}

async fn handle_validate(profile: &str, set: &[String], emit_json: bool) -> Result<i32> {
    let profile_id: ProfileId = profile.parse().map_err(anyhow::Error::from)?;
    let overrides = parse_overrides(set)?;
    let env = SwitchEnvironment::from_system()?;
    let report = orchestrator::validate_profile(&env, profile_id, &overrides).await?;

    if emit_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_probe_report(&report);
    }
    Ok(if report.reachable { 0 } else { 1 })
}

fn print_probe_report(report: &ProbeReport) {
    println!("Probe report for {}", report.profile);
    println!(
        "Reachable : {}",
        if report.reachable { "yes" } else { "no" }
    );
    if let Some(latency) = report.latency_ms {
        println!("Latency   : {latency} ms");
    }
    println!("Attempts  : {}", report.attempts);
    match &report.schema {
        Some(SchemaReport::Present) => println!("Schema    : present"),
        Some(SchemaReport::Absent { missing }) => {
            println!("Schema    : absent (missing {})", missing.join(", "));
        }
        None => println!("Schema    : not checked"),
    }
    if let (Some(code), Some(message)) = (&report.error_code, &report.error) {
        println!("Error     : {message} ({code})");
    }
}

fn step_label(step: &SwitchStep) -> &'static str {
    match step {
        SwitchStep::Config => "Config",
        SwitchStep::SourceProbe => "Source probe",
        SwitchStep::Backup => "Backup",
        SwitchStep::Swap => "Swap",
        SwitchStep::TargetProbe => "Target probe",
        SwitchStep::Migrate => "Migrate",
        SwitchStep::Commit => "Commit",
        SwitchStep::Rollback => "Rollback",
    }
}

fn step_state_label(state: &SwitchStepState) -> &'static str {
    match state {
        SwitchStepState::Pending => "pending",
        SwitchStepState::Running => "running",
        SwitchStepState::Success => "success",
        SwitchStepState::Warning => "warning",
        SwitchStepState::Skipped => "skipped",
        SwitchStepState::Failed => "failed",
    }
}
