use anyhow::Context;
use std::path::Path;
use vault_core::config::Config;
use vault_core::types::Stage;
use vault_core::{io, paths};

/// Create the stage directories, `.vault/` and a default config. Safe to
/// run on an existing vault: nothing already present is overwritten.
pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing vault in: {}", root.display());

    io::ensure_dir(root).with_context(|| format!("failed to create {}", root.display()))?;

    let mut dirs: Vec<&str> = Stage::all().iter().map(|s| s.dir_name()).collect();
    dirs.extend([paths::LOGS_DIR, paths::BRIEFINGS_DIR, paths::ORDERS_DIR, paths::STATE_DIR]);
    for dir in dirs {
        let p = root.join(dir);
        let existed = p.is_dir();
        io::ensure_dir(&p).with_context(|| format!("failed to create {}", p.display()))?;
        if !existed {
            println!("  created: {dir}/");
        }
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::default()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }

    println!("\nvault initialized. Next: vault config validate, then vault run --dry-run");
    Ok(())
}
