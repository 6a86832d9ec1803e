use crate::output::{print_json, print_table};
use anyhow::Context;
use chrono::Utc;
use std::path::Path;
use vault_core::config::Config;
use vault_core::types::ExecutionMode;
use vault_core::vault::Vault;
use vault_supervisor::jobs;
use vault_supervisor::SupervisorContext;

pub fn run(root: &Path, days: Option<u32>, dry_run: bool, json: bool) -> anyhow::Result<()> {
    if !root.is_dir() {
        anyhow::bail!("vault root {} does not exist", root.display());
    }
    let config = Config::load(root).context("failed to load config")?;
    let window = days.unwrap_or(config.reflection.window_days);
    if window == 0 {
        anyhow::bail!("--days must be at least 1");
    }

    let vault = Vault::open(root, ExecutionMode::from_dry_run(dry_run)).context("failed to open vault")?;
    let ctx = SupervisorContext::new(vault, config);
    let (report, path) = jobs::reflect(&ctx, window, Utc::now()).context("reflection failed")?;

    if json {
        return print_json(&serde_json::json!({
            "report": report,
            "path": path,
        }));
    }

    println!(
        "Reflection {} → {} ({} days): {}",
        report.period_start,
        report.period_end,
        report.window_days,
        report.score.as_str()
    );
    let rows: Vec<Vec<String>> = report
        .findings
        .iter()
        .map(|f| vec![f.area.clone(), f.score.as_str().to_string(), f.detail.clone()])
        .collect();
    print_table(&["AREA", "SCORE", "DETAIL"], &rows);
    for rec in &report.recommendations {
        println!("- {rec}");
    }
    match path {
        Some(p) => println!("\nwritten: {}", p.display()),
        None => println!("\ndry run: report not written"),
    }
    Ok(())
}
