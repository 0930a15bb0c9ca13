use anyhow::Result;
use colored::Colorize;
use http_telemetry::config::{self, Config};
use std::path::Path;
use tracing::info;

/// Execute the config show command
///
/// Displays the current configuration with secrets masked
pub fn show(path: &Path) -> Result<()> {
    println!("{}", "Loading configuration...".yellow());
    info!("Loading configuration for display");

    let cfg = config::load_config(path)?;
    let sanitized = sanitize_secrets(&cfg);

    println!("{}", "Current Configuration:".green().bold());
    println!();

    let toml_string = toml::to_string_pretty(&sanitized)?;
    println!("{}", toml_string);

    Ok(())
}

/// Execute the config validate command
pub fn validate(path: &Path) -> Result<()> {
    println!("{}", "Validating configuration...".yellow());

    let cfg = config::load_config(path)?;
    config::warn_insecure_settings(&cfg);

    println!("{}", "✓ Configuration is valid".green());
    println!();
    println!("{}", "Summary:".bold());
    println!("  {}: {}:{}", "Server".cyan(), cfg.server.host, cfg.server.port);
    println!("  {}: {}", "Prefix".cyan(), cfg.plugin.prefix);
    println!(
        "  {}: {}",
        "Unrestricted Routes".cyan(),
        cfg.plugin.all_unrestricted_routes().join(", ")
    );
    match cfg.resolved_remote() {
        Some(remote) => println!("  {}: {} (index {})", "Remote Store".cyan(), remote.uri, remote.index),
        None => println!("  {}: {}", "Remote Store".cyan(), "disabled".red()),
    }

    info!("Configuration validation successful");
    Ok(())
}

/// Sanitize secrets in configuration for safe display
fn sanitize_secrets(cfg: &Config) -> Config {
    let mut sanitized = cfg.clone();

    if let Some(remote) = sanitized.telemetry.remote.as_mut() {
        remote.password = remote.password.as_deref().map(mask_secret);
    }

    sanitized
}

/// Mask a secret for safe display
///
/// Example: "changeme-please" -> "ch...se"
fn mask_secret(secret: &str) -> String {
    if secret.chars().count() <= 8 {
        return "***".to_string();
    }

    let prefix: String = secret.chars().take(2).collect();
    let suffix: String = secret.chars().skip(secret.chars().count() - 2).collect();

    format!("{}...{}", prefix, suffix)
}
