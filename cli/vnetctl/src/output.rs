//! Table and JSON rendering.
//!
//! JSON output is wrapped in `{"schemaVersion": .., "data": ..}` so scripts
//! can detect format changes. Keys come out sorted: `serde_json::Map` is
//! ordered unless `preserve_order` is enabled.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};
use vnet_controller::model::TaskStatus;

const CLI_SCHEMA_VERSION: &str = "vnetctl.v1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

impl OutputFormat {
    /// Anything other than `json` renders tables.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("json") {
            Self::Json
        } else {
            Self::Table
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a, T: Serialize + ?Sized> {
    #[serde(rename = "schemaVersion")]
    schema_version: &'static str,
    data: &'a T,
}

pub fn print_output<T: Serialize + Tabled>(rows: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", format_json(rows)),
        OutputFormat::Table if rows.is_empty() => println!("{}", "(none)".dimmed()),
        OutputFormat::Table => println!("{}", Table::new(rows)),
    }
}

/// Nested state has no useful table shape; single items are always JSON.
pub fn print_single<T: Serialize>(item: &T) {
    println!("{}", format_json(item));
}

pub fn print_success(message: &str) {
    println!("{} {message}", "ok".green().bold());
}

/// Report the IDs created by a write, as a message or a JSON receipt.
pub fn print_receipt(format: OutputFormat, kind: &str, message: &str, ids: serde_json::Value) {
    match format {
        OutputFormat::Table => print_success(message),
        OutputFormat::Json => print_single(&receipt_value(kind, ids)),
    }
}

pub fn receipt_value(kind: &str, ids: serde_json::Value) -> serde_json::Value {
    serde_json::json!({ "receipt": { "kind": kind, "ids": ids } })
}

pub fn colored_status(status: TaskStatus) -> String {
    let label = status.as_str();
    match status {
        TaskStatus::Queued => label.dimmed().to_string(),
        TaskStatus::InProgress => label.blue().to_string(),
        TaskStatus::Successful => label.green().to_string(),
        TaskStatus::Failed => label.red().bold().to_string(),
        TaskStatus::Cancelled => label.yellow().to_string(),
    }
}

pub fn display_option(opt: &Option<String>) -> String {
    opt.as_deref().unwrap_or("-").to_string()
}

fn format_json<T: Serialize + ?Sized>(data: &T) -> String {
    // Round-trip through Value so struct fields are sorted like map keys.
    let envelope = Envelope {
        schema_version: CLI_SCHEMA_VERSION,
        data,
    };
    serde_json::to_value(&envelope)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|e| format!("{{\"error\": \"{e}\"}}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_value_carries_kind_and_ids() {
        let value = receipt_value("tasks.enqueue", serde_json::json!({ "task_id": "task_1" }));
        assert_eq!(
            value,
            serde_json::json!({
                "receipt": { "kind": "tasks.enqueue", "ids": { "task_id": "task_1" } }
            })
        );
    }

    #[test]
    fn json_output_is_wrapped_and_sorted() {
        let out = format_json(&serde_json::json!({ "b": 1, "a": { "d": 2, "c": 3 } }));
        let a = out.find("\"a\"").unwrap();
        let b = out.find("\"b\"").unwrap();
        assert!(a < b);
        assert!(out.contains(CLI_SCHEMA_VERSION));
        assert!(out.find("\"c\"").unwrap() < out.find("\"d\"").unwrap());
    }

    #[test]
    fn unknown_format_falls_back_to_table() {
        assert_eq!(OutputFormat::parse("json"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::parse("yaml"), OutputFormat::Table);
    }
}
