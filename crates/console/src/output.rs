//! Output formatting for the console CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::reconciler::{ConsoleView, Phase};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Plain text format
    Plain,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a single item
pub fn print_item<T: Serialize + TableDisplay>(item: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(T::headers());
            table.add_row(item.row());
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(item).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for (header, value) in T::headers().iter().zip(item.row()) {
                println!("{}: {}", header, value);
            }
        }
    }
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    if items.is_empty() && format == OutputFormat::Table {
        println!("No items found.");
        return;
    }

    match format {
        OutputFormat::Table => {
            let mut table = table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
        OutputFormat::Yaml => {
            print!("{}", serde_yaml::to_string(items).unwrap_or_default());
        }
        OutputFormat::Plain => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    println!("---");
                }
                for (header, value) in T::headers().iter().zip(item.row()) {
                    println!("{}: {}", header, value);
                }
            }
        }
    }
}

/// Print a simple message
pub fn print_message(message: &str, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::json!({ "message": message }));
        }
        OutputFormat::Yaml => {
            println!("message: {:?}", message);
        }
        _ => println!("{}", message),
    }
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✔".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✘".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow().bold(), message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("{} {}", "i".cyan(), message);
}

/// Colored one-word rendering of a phase
pub fn phase_label(phase: Phase) -> String {
    let text = phase.to_string();
    match phase {
        Phase::ServerUnknown => text.dimmed().to_string(),
        Phase::ServerOffline { .. } => text.red().bold().to_string(),
        Phase::VmAbsent => text.yellow().to_string(),
        Phase::VmStopped { .. } => text.blue().to_string(),
        Phase::VmRunning { .. } => text.green().bold().to_string(),
    }
}

impl TableDisplay for ConsoleView {
    fn headers() -> Vec<&'static str> {
        vec!["VM", "Case", "Phase", "Console Port", "Actions", "Checked"]
    }

    fn row(&self) -> Vec<String> {
        let actions: Vec<&str> = self.affordances.iter().map(|a| a.as_str()).collect();
        vec![
            self.vm_id.to_string(),
            self.case_name.clone(),
            phase_label(self.phase),
            self.websocket_port.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            if actions.is_empty() {
                "-".to_string()
            } else {
                actions.join(", ")
            },
            self.reachability
                .map(|r| r.checked_label())
                .unwrap_or_else(|| "-".to_string()),
        ]
    }
}

/// Style for a transfer bar, bounded when the total is known
pub fn transfer_style(total: Option<u64>) -> ProgressStyle {
    let template = if total.is_some() {
        "{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})"
    } else {
        "{spinner} {msg} {bytes}"
    };
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Byte-counting progress bar for transfers
pub fn transfer_bar(label: &str, total: Option<u64>) -> ProgressBar {
    let bar = match total {
        Some(total) => ProgressBar::new(total),
        None => ProgressBar::new_spinner(),
    };
    bar.set_style(transfer_style(total));
    bar.set_message(label.to_string());
    bar
}

/// Human-readable size from megabytes
pub fn format_mb(size_mb: f64) -> String {
    if size_mb >= 1024.0 {
        format!("{:.1}GB", size_mb / 1024.0)
    } else {
        format!("{:.1}MB", size_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_mb() {
        assert_eq!(format_mb(512.5), "512.5MB");
        assert_eq!(format_mb(2048.0), "2.0GB");
    }
}
