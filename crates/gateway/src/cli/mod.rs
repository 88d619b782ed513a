pub mod config;
pub mod doctor;
pub mod run;

use clap::{Parser, Subcommand};

/// jarvis — a three-layer reasoning orchestrator.
#[derive(Debug, Parser)]
#[command(name = "jarvis", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send a single message through the orchestrator and print the response.
    Run {
        /// The message to send.
        message: String,
        /// Conversation/session key (defaults to "cli:run").
        #[arg(long, default_value = "cli:run")]
        session: String,
        /// Model override (e.g. "ollama/llama3.1").
        #[arg(long)]
        model: Option<String>,
        /// Print every streamed event as JSON instead of plain text.
        #[arg(long)]
        json: bool,
    },
    /// Run diagnostic checks against the current configuration.
    Doctor,
    /// Configuration utilities.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version information.
    Version,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Parse the config file and report any errors.
    Validate,
    /// Dump the resolved configuration (with defaults) as TOML.
    Show,
}

// ── Config loading helper ─────────────────────────────────────────────

/// Load the configuration from the path specified by `JARVIS_CONFIG` (or
/// `config.toml` by default). Returns the parsed [`Config`] and the path
/// that was used. Shared by `run`, `doctor`, and `config` so the logic
/// lives in one place.
pub fn load_config() -> anyhow::Result<(jarvis_domain::config::Config, String)> {
    let config_path = std::env::var("JARVIS_CONFIG").unwrap_or_else(|_| "config.toml".into());

    let config = if std::path::Path::new(&config_path).exists() {
        let raw = std::fs::read_to_string(&config_path)
            .map_err(|e| anyhow::anyhow!("reading {config_path}: {e}"))?;
        toml::from_str(&raw).map_err(|e| anyhow::anyhow!("parsing {config_path}: {e}"))?
    } else {
        jarvis_domain::config::Config::default()
    };

    Ok((config, config_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `load_config` reads process-wide env vars; serialize tests that touch it.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("JARVIS_CONFIG", "/nonexistent/path/for/test.toml");
        let (config, path) = load_config().unwrap();
        assert_eq!(path, "/nonexistent/path/for/test.toml");
        assert_eq!(config.orchestrator.max_loop_iterations, 5);
        std::env::remove_var("JARVIS_CONFIG");
    }

    #[test]
    fn existing_config_file_is_parsed() {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[orchestrator]\nmax_loop_iterations = 9\n").unwrap();
        std::env::set_var("JARVIS_CONFIG", path.to_str().unwrap());

        let (config, _) = load_config().unwrap();
        assert_eq!(config.orchestrator.max_loop_iterations, 9);
        std::env::remove_var("JARVIS_CONFIG");
    }
}
