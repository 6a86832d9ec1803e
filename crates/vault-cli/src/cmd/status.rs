use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use vault_core::config::Config;
use vault_core::index::Escalation;
use vault_core::paths;
use vault_core::types::{ExecutionMode, Stage};
use vault_core::vault::Vault;
use vault_core::VaultError;

#[derive(Serialize)]
struct Overdue {
    id: String,
    stage: Stage,
    age_hours: f64,
}

#[derive(Serialize)]
struct Status {
    root: String,
    stages: BTreeMap<Stage, usize>,
    overdue: Vec<Overdue>,
    escalations: Vec<Escalation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

/// Counts per stage from the reconciled index, items past their lag
/// thresholds, and router escalations.
pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let status = collect(root)?;
    if json {
        return print_json(&status);
    }

    println!("Vault: {}\n", status.root);
    let rows: Vec<Vec<String>> = status
        .stages
        .iter()
        .map(|(s, n)| vec![s.dir_name().to_string(), n.to_string()])
        .collect();
    print_table(&["STAGE", "ITEMS"], &rows);

    if !status.overdue.is_empty() {
        println!("\nOverdue:");
        let rows: Vec<Vec<String>> = status
            .overdue
            .iter()
            .map(|o| vec![o.id.clone(), o.stage.dir_name().to_string(), format!("{:.1}h", o.age_hours)])
            .collect();
        print_table(&["ITEM", "STAGE", "AGE"], &rows);
    }
    if let Some(note) = &status.note {
        println!("\nnote: {note}");
    }
    if !status.escalations.is_empty() {
        println!("\nEscalated (left in Approved/ until handled):");
        let rows: Vec<Vec<String>> = status
            .escalations
            .iter()
            .map(|e| vec![e.item_id.clone(), e.handler.clone(), e.error.clone()])
            .collect();
        print_table(&["ITEM", "HANDLER", "ERROR"], &rows);
    }
    Ok(())
}

/// Falls back to a read-only scan when the index file is held by a running
/// `vault run`. Escalations live only in that file, so they are left out.
fn collect(root: &Path) -> anyhow::Result<Status> {
    if !paths::state_dir(root).is_dir() {
        anyhow::bail!("no vault at {}; run `vault init` first", root.display());
    }
    let config = Config::load(root).context("failed to load config")?;
    let (vault, note) = match Vault::open(root, ExecutionMode::Live) {
        Ok(vault) => (vault, None),
        Err(VaultError::Index(reason)) => {
            tracing::debug!(%reason, "index busy, scanning stage directories instead");
            let vault = Vault::open(root, ExecutionMode::DryRun).context("failed to open vault")?;
            let note = format!("index in use ({reason}); escalations unavailable");
            (vault, Some(note))
        }
        Err(e) => return Err(e).context("failed to open vault"),
    };

    let mut stages: BTreeMap<Stage, usize> = Stage::all().iter().map(|s| (*s, 0)).collect();
    for rec in vault.index().items().context("failed to read index")? {
        *stages.entry(rec.stage).or_default() += 1;
    }

    let snapshot = vault.snapshot(Utc::now()).context("failed to scan vault")?;
    let t = &config.thresholds;
    let mut overdue = Vec::new();
    for (stage, limit) in [
        (Stage::PendingApproval, t.approval_lag()),
        (Stage::NeedsAction, t.stuck_after()),
    ] {
        overdue.extend(snapshot.older_than(stage, limit).into_iter().map(|i| Overdue {
            id: i.id.clone(),
            stage,
            age_hours: i.age_hours,
        }));
    }
    let escalations = if note.is_none() {
        vault.index().escalations().context("failed to read escalations")?
    } else {
        Vec::new()
    };

    Ok(Status {
        root: root.display().to_string(),
        stages,
        overdue,
        escalations,
        note,
    })
}
