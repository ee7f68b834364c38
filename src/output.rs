//! Rendering of validation results.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::cli::{OutputFormat, VerbosityLevel};
use crate::engine::{FileValidationResult, ValidationResults, ValidationStatus};
use crate::validator::ValidationEvent;

pub struct Output {
    format: OutputFormat,
    verbosity: VerbosityLevel,
    show_colors: bool,
}

#[derive(Serialize)]
struct JsonReport<'a> {
    generated_at: String,
    tool: &'static str,
    version: &'static str,
    #[serde(flatten)]
    results: &'a ValidationResults,
}

impl Output {
    pub fn new(format: OutputFormat, verbosity: VerbosityLevel) -> Self {
        Self {
            format,
            verbosity,
            show_colors: format == OutputFormat::Human && atty::is(atty::Stream::Stdout),
        }
    }

    pub fn with_colors(mut self, show_colors: bool) -> Self {
        self.show_colors = show_colors;
        self
    }

    fn colorize(&self, text: &str, color: &str) -> String {
        if self.show_colors {
            format!("\x1b[{}m{}\x1b[0m", color, text)
        } else {
            text.to_string()
        }
    }

    pub fn render(&self, results: &ValidationResults) -> serde_json::Result<String> {
        match self.format {
            OutputFormat::Human => Ok(self.format_human(results)),
            OutputFormat::Json => self.format_json(results),
            OutputFormat::Summary => Ok(self.format_summary(results)),
        }
    }

    pub fn format_json(&self, results: &ValidationResults) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&JsonReport {
            generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            tool: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            results,
        })
    }

    pub fn format_human(&self, results: &ValidationResults) -> String {
        let mut output = String::new();
        for result in &results.file_results {
            let show = match self.verbosity {
                VerbosityLevel::Quiet => result.status.is_invalid() || result.status.is_error(),
                VerbosityLevel::Normal => !result.status.is_valid(),
                VerbosityLevel::Verbose => true,
            };
            if show {
                output.push_str(&self.format_file_result(result));
                output.push('\n');
            }
        }
        if self.verbosity != VerbosityLevel::Quiet || results.has_errors() || results.has_diagnostics() {
            output.push_str(&self.format_summary(results));
        }
        output
    }

    pub fn format_file_result(&self, result: &FileValidationResult) -> String {
        let path = result.path.display();
        let duration = format_duration(result.duration);

        match &result.status {
            ValidationStatus::Valid => {
                format!("{}  {} ({})", self.colorize("VALID", "32"), path, duration)
            }
            ValidationStatus::Invalid { diagnostic_count } => {
                let mut output = format!(
                    "{}  {} ({}) - {} diagnostic{}",
                    self.colorize("INVALID", "31"),
                    path,
                    duration,
                    diagnostic_count,
                    if *diagnostic_count == 1 { "" } else { "s" }
                );
                for event in &result.events {
                    output.push_str("\n    ");
                    output.push_str(&self.format_event(event));
                }
                output
            }
            ValidationStatus::Error { message } => format!(
                "{}  {} ({}) - {}",
                self.colorize("ERROR", "33"),
                path,
                duration,
                message
            ),
            ValidationStatus::Skipped { reason } => format!(
                "{}  {} ({}) - {}",
                self.colorize("SKIPPED", "36"),
                path,
                duration,
                reason
            ),
        }
    }

    fn format_event(&self, event: &ValidationEvent) -> String {
        let mut line = format!("{} [{}", event.location, event.kind);
        if let Some(role) = &event.role {
            line.push_str(&format!(" {}", role));
        }
        line.push_str(&format!("] {}", event.message));

        if self.verbosity == VerbosityLevel::Verbose {
            line.push_str(&format!("\n      test: {}", event.test));
            if let Some(pattern) = &event.pattern_id {
                line.push_str(&format!("\n      pattern: {}", pattern));
            }
            for diagnostic in &event.diagnostics {
                line.push_str(&format!("\n      {}: {}", diagnostic.id, diagnostic.message));
            }
        }
        line
    }

    pub fn format_summary(&self, results: &ValidationResults) -> String {
        let mut output = String::from("Validation Summary:\n");
        output.push_str(&format!("  Total files: {}\n", results.total_files));
        output.push_str(&format!(
            "  {} {}\n",
            self.colorize("Valid:", "32"),
            results.valid_files
        ));
        if results.invalid_files > 0 {
            output.push_str(&format!(
                "  {} {} ({} diagnostics)\n",
                self.colorize("Invalid:", "31"),
                results.invalid_files,
                results.total_diagnostics
            ));
        }
        if results.error_files > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Errors:", "33"),
                results.error_files
            ));
        }
        if results.skipped_files > 0 {
            output.push_str(&format!(
                "  {} {}\n",
                self.colorize("Skipped:", "36"),
                results.skipped_files
            ));
        }
        output.push_str(&format!("  Success rate: {:.1}%\n", results.success_rate()));
        output.push_str(&format!(
            "  Duration: {}\n",
            format_duration(results.total_duration)
        ));

        if self.verbosity == VerbosityLevel::Verbose {
            output.push_str(&format!(
                "  Schemas: {} (cache hit rate {:.1}%)\n",
                results.schemas_used.len(),
                results.cache.hit_rate() * 100.0
            ));
        }
        output
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs_f64();
    if secs < 1.0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60.0 {
        format!("{:.2}s", secs)
    } else {
        format!("{}m{:.1}s", (secs / 60.0) as u64, secs % 60.0)
    }
}
