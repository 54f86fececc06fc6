//! Configuration inspection commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;

use crate::cli::output::{list_table, output, CommandOutput};
use crate::domain::models::{Config, SyncSource};
use crate::infrastructure::config::ConfigLoader;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Validate the configuration and summarise key limits
    Validate,
}

#[derive(Debug, Serialize)]
pub struct ConfigShowOutput {
    pub config: Config,
}

impl CommandOutput for ConfigShowOutput {
    fn to_human(&self) -> String {
        serde_yaml::to_string(&self.config).unwrap_or_default()
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigSummaryOutput {
    pub valid: bool,
    pub poll_interval_ms: u64,
    pub max_detection_attempts: u32,
    pub max_retries: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub source_priorities: Vec<(SyncSource, u32)>,
}

impl ConfigSummaryOutput {
    fn from_config(config: &Config) -> Self {
        Self {
            valid: true,
            poll_interval_ms: u64::try_from(config.detection.effective_poll_interval().as_millis())
                .unwrap_or(u64::MAX),
            max_detection_attempts: config.detection.max_detection_attempts,
            max_retries: config.retry.max_retries,
            breaker_threshold: config.circuit_breaker.failure_threshold,
            breaker_cooldown_ms: config.circuit_breaker.cooldown_ms,
            source_priorities: SyncSource::ALL
                .iter()
                .map(|source| (*source, config.sync.priority_of(*source)))
                .collect(),
        }
    }
}

impl CommandOutput for ConfigSummaryOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!("{} configuration is valid", console::style("✓").green())];
        lines.push(format!("  Detection poll interval: {}ms", self.poll_interval_ms));
        lines.push(format!("  Detection attempts:      {}", self.max_detection_attempts));
        lines.push(format!("  Retry budget:            {}", self.max_retries));
        lines.push(format!(
            "  Circuit breaker:         opens after {} failures, cools down {}ms",
            self.breaker_threshold, self.breaker_cooldown_ms
        ));

        let mut table = list_table(&["source", "priority"]);
        for (source, priority) in &self.source_priorities {
            table.add_row(vec![source.to_string(), priority.to_string()]);
        }
        lines.push(String::new());
        lines.push(table.to_string());
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

pub fn execute(args: ConfigArgs, config: &Config, json_mode: bool) -> Result<()> {
    match args.command {
        ConfigCommands::Show => {
            output(
                &ConfigShowOutput {
                    config: config.clone(),
                },
                json_mode,
            );
        }
        ConfigCommands::Validate => {
            ConfigLoader::validate(config).context("Configuration is invalid")?;
            output(&ConfigSummaryOutput::from_config(config), json_mode);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_lists_every_source() {
        let summary = ConfigSummaryOutput::from_config(&Config::default());
        assert_eq!(summary.source_priorities.len(), 5);
        assert_eq!(summary.source_priorities[0], (SyncSource::CallKit, 100));
        assert!(summary.to_human().contains("callkit"));
    }
}
