use conclave_core::{Config, Paths};

/// Write the default configuration to `<home>/config.json`.
pub async fn init(paths: &Paths, force: bool) -> anyhow::Result<()> {
    let path = paths.config_file();

    if path.exists() && !force {
        println!("Config already exists: {}", path.display());
        println!("Use --force to overwrite.");
        return Ok(());
    }

    Config::default().save(&path)?;
    std::fs::create_dir_all(paths.data_dir())?;
    println!("✓ Wrote {}", path.display());
    Ok(())
}

/// Show the effective configuration as pretty-printed JSON.
pub async fn show(paths: &Paths) -> anyhow::Result<()> {
    let config = Config::load_or_default(paths)?;

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {}{}",
        paths.config_file().display(),
        if paths.config_file().exists() { "" } else { " (defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
