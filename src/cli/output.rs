//! Output formatting utilities for the CLI.

use comfy_table::{presets, Cell, CellAlignment, ContentArrangement, Table};
use console::{style, StyledObject};
use serde::Serialize;

use crate::domain::models::CallUIState;

pub trait CommandOutput: Serialize {
    fn to_human(&self) -> String;
    fn to_json(&self) -> serde_json::Value;
}

pub fn output<T: CommandOutput>(result: &T, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&result.to_json()).unwrap_or_default());
    } else {
        println!("{}", result.to_human());
    }
}

/// Borderless table with upper-cased headers.
pub fn list_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .map(|h| Cell::new(h.to_uppercase()).set_alignment(CellAlignment::Left)),
        );
    table
}

/// Colour a call state by outcome.
pub fn colorize_state(state: CallUIState) -> StyledObject<&'static str> {
    let label = state.as_str();
    match state {
        CallUIState::CallKitActive | CallUIState::Completed => style(label).green().bold(),
        CallUIState::RetryExhausted | CallUIState::Error => style(label).red().bold(),
        s if s.is_failure() => style(label).red(),
        CallUIState::Retrying | CallUIState::Detecting | CallUIState::Backgrounding => {
            style(label).yellow()
        }
        s if s.requires_ui() => style(label).cyan(),
        CallUIState::Terminated => style(label).dim(),
        _ => style(label),
    }
}
