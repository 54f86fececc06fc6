//! Scripted end-to-end call simulation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;

use crate::adapters::ScriptedObservationSource;
use crate::application::CallCoordinator;
use crate::cli::output::{colorize_state, list_table, output, CommandOutput};
use crate::domain::models::{
    AppForegroundState, CallObservation, CallToken, CallUIState, Config, SyncSource, SystemCall,
    TransitionTrigger,
};

const SETTLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// App backgrounds and the native UI takes the call
    NativeUi,
    /// Native UI never appears; retries run out and the in-app UI is required
    Fallback,
    /// Native UI succeeds, then the backend and native UI report conflicting states
    Conflict,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Scenario to run
    #[arg(short, long, value_enum, default_value = "native-ui")]
    pub scenario: Scenario,

    /// Call token (random when omitted)
    #[arg(long)]
    pub call: Option<String>,

    /// Keep configured timings instead of compressing them
    #[arg(long)]
    pub real_timing: bool,

    /// Give up waiting for the call to settle after this many seconds
    #[arg(long, default_value = "30")]
    pub timeout_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct TransitionRow {
    pub state: CallUIState,
    pub trigger: TransitionTrigger,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct RetryRow {
    pub attempts: u32,
    pub strategy: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConflictRow {
    pub resolution: String,
    pub winner: SyncSource,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct SimulationOutput {
    pub scenario: Scenario,
    pub call_token: CallToken,
    pub settled: bool,
    pub final_state: Option<CallUIState>,
    pub transitions: Vec<TransitionRow>,
    pub retries: Vec<RetryRow>,
    pub conflicts: Vec<ConflictRow>,
    pub notifications: BTreeMap<String, usize>,
    pub health_score: f64,
}

impl CommandOutput for SimulationOutput {
    fn to_human(&self) -> String {
        let mut lines = vec![format!(
            "Call {} ({:?}): {}",
            console::style(&self.call_token).bold(),
            self.scenario,
            self.final_state
                .map_or_else(|| "unknown".to_string(), |s| colorize_state(s).to_string())
        )];
        if !self.settled {
            lines.push(format!(
                "{} call did not settle before the timeout",
                console::style("!").yellow()
            ));
        }

        let mut table = list_table(&["state", "trigger", "at"]);
        for row in &self.transitions {
            table.add_row(vec![
                colorize_state(row.state).to_string(),
                row.trigger.to_string(),
                row.at.clone(),
            ]);
        }
        lines.push(String::new());
        lines.push(table.to_string());

        if !self.retries.is_empty() {
            let mut table = list_table(&["attempts", "strategy", "success", "error"]);
            for row in &self.retries {
                table.add_row(vec![
                    row.attempts.to_string(),
                    row.strategy.clone(),
                    row.success.to_string(),
                    row.error.clone().unwrap_or_default(),
                ]);
            }
            lines.push(String::new());
            lines.push("Retries:".to_string());
            lines.push(table.to_string());
        }

        if !self.conflicts.is_empty() {
            let mut table = list_table(&["resolution", "winner", "reason"]);
            for row in &self.conflicts {
                table.add_row(vec![
                    row.resolution.clone(),
                    row.winner.to_string(),
                    row.reason.clone(),
                ]);
            }
            lines.push(String::new());
            lines.push("Conflicts:".to_string());
            lines.push(table.to_string());
        }

        lines.push(String::new());
        let counts: Vec<String> = self
            .notifications
            .iter()
            .map(|(kind, n)| format!("{kind}={n}"))
            .collect();
        lines.push(format!("Notifications: {}", counts.join(", ")));
        lines.push(format!("Health score:  {:.2}", self.health_score));
        lines.join("\n")
    }

    fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }
}

/// Shrink every delay so a scenario finishes in well under a second.
fn compress_timings(config: &mut Config) {
    config.detection.poll_interval_ms = 10;
    config.detection.lag_poll_interval_ms = 10;
    config.detection.max_detection_duration_ms = 200;
    config.retry.initial_delay_ms = 5;
    config.retry.max_delay_ms = 40;
    config.retry.per_attempt_timeout_ms = 200;
    config.circuit_breaker.cooldown_ms = 1_000;
}

fn observation_for(scenario: Scenario, call_token: &CallToken) -> CallObservation {
    match scenario {
        Scenario::NativeUi | Scenario::Conflict => CallObservation::new(
            AppForegroundState::Background,
            vec![SystemCall::new(call_token.as_str()).connected()],
        ),
        Scenario::Fallback => CallObservation::new(AppForegroundState::Active, Vec::new()),
    }
}

pub async fn execute(args: SimulateArgs, config: &Config, json_mode: bool) -> Result<()> {
    let result = run(&args, config.clone()).await?;
    output(&result, json_mode);
    Ok(())
}

/// Drive one call through the wired engines and report what happened.
pub async fn run(args: &SimulateArgs, mut config: Config) -> Result<SimulationOutput> {
    if !args.real_timing {
        compress_timings(&mut config);
    }
    let call_token = args
        .call
        .as_deref()
        .map_or_else(CallToken::generate, CallToken::new);
    let source = Arc::new(ScriptedObservationSource::fixed(observation_for(
        args.scenario,
        &call_token,
    )));

    let coordinator = CallCoordinator::new(config, source);
    let mut notifications_rx = coordinator.hub().subscribe();
    coordinator.start().await;

    let machine = coordinator.state_machine();
    let metadata = HashMap::from([("scenario".to_string(), format!("{:?}", args.scenario))]);
    machine
        .initialize_call(&call_token, metadata.clone())
        .await
        .context("Failed to initialize call")?;
    machine
        .transition_state(
            &call_token,
            CallUIState::Detecting,
            TransitionTrigger::UserAction,
            metadata,
        )
        .await
        .context("Failed to start detection")?;

    let settled = tokio::time::timeout(Duration::from_secs(args.timeout_secs), async {
        loop {
            match machine.get_current_state(&call_token).await {
                Some(CallUIState::CallKitActive | CallUIState::RetryExhausted) | None => break,
                Some(_) => tokio::time::sleep(SETTLE_POLL).await,
            }
        }
    })
    .await
    .is_ok();

    if args.scenario == Scenario::Conflict {
        let synchronizer = coordinator.synchronizer();
        synchronizer
            .sync_state(
                SyncSource::Backend,
                &call_token,
                None,
                CallUIState::FallbackUIActive,
                HashMap::new(),
            )
            .await?;
        synchronizer
            .sync_state(
                SyncSource::CallKit,
                &call_token,
                None,
                CallUIState::CallKitActive,
                HashMap::new(),
            )
            .await?;
    }

    if machine.get_current_state(&call_token).await == Some(CallUIState::CallKitActive) {
        machine.complete_call(&call_token, true).await?;
    }

    let health = machine.analyze_health().await;
    // Let the hub dispatcher drain before reading the stream.
    tokio::time::sleep(SETTLE_POLL).await;
    coordinator.shutdown().await;

    let mut notifications = BTreeMap::new();
    loop {
        match notifications_rx.try_recv() {
            Ok(notification) => {
                *notifications
                    .entry(notification.kind().to_string())
                    .or_insert(0) += 1;
            }
            Err(TryRecvError::Lagged(_)) => {}
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }

    let transitions = machine
        .get_state_history(&call_token, usize::MAX)
        .await
        .into_iter()
        .map(|snapshot| TransitionRow {
            state: snapshot.state,
            trigger: snapshot.trigger,
            at: snapshot.timestamp.format("%H:%M:%S%.3f").to_string(),
        })
        .collect();
    let retries = coordinator
        .retry()
        .retry_history(usize::MAX)
        .await
        .into_iter()
        .filter(|r| r.call_token == call_token)
        .map(|r| RetryRow {
            attempts: r.attempts,
            strategy: r.strategy.to_string(),
            success: r.success,
            error: r.error,
        })
        .collect();
    let conflicts = coordinator
        .synchronizer()
        .conflict_history(usize::MAX)
        .await
        .into_iter()
        .filter(|c| c.call_token() == &call_token)
        .map(|c| ConflictRow {
            resolution: c.resolution.to_string(),
            winner: c.winner,
            reason: c.reason,
        })
        .collect();

    Ok(SimulationOutput {
        scenario: args.scenario,
        final_state: machine.get_current_state(&call_token).await,
        call_token,
        settled,
        transitions,
        retries,
        conflicts,
        notifications,
        health_score: health.score,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(scenario: Scenario) -> SimulateArgs {
        SimulateArgs {
            scenario,
            call: Some("sim-call".to_string()),
            real_timing: false,
            timeout_secs: 10,
        }
    }

    #[tokio::test]
    async fn test_native_ui_scenario_completes() {
        let result = run(&args(Scenario::NativeUi), Config::default()).await.unwrap();
        assert!(result.settled);
        assert_eq!(result.final_state, Some(CallUIState::Completed));
        assert!(result
            .transitions
            .iter()
            .any(|row| row.state == CallUIState::CallKitActive));
        assert!(result.retries.is_empty());
    }

    #[tokio::test]
    async fn test_fallback_scenario_exhausts_retries() {
        let result = run(&args(Scenario::Fallback), Config::default()).await.unwrap();
        assert!(result.settled);
        assert_eq!(result.final_state, Some(CallUIState::RetryExhausted));
        assert_eq!(result.retries.len(), 1);
        assert!(!result.retries[0].success);
        assert_eq!(result.notifications.get("fallback_ui_required"), Some(&1));
    }
}
