// Output module: errors, progress events and result rendering

use indicatif::ProgressBar;

pub mod errors;
pub mod events;
pub mod json_output;
pub mod terminal;

pub use errors::*;
pub use events::*;
pub use json_output::*;
pub use terminal::*;

use crate::executor::BatchResult;

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text output with colors
    #[default]
    Text,
    /// The batch result as JSON
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(()),
        }
    }
}

/// Unified output writer supporting both text and JSON formats
pub enum OutputWriter {
    Text(TerminalOutput),
    Json(JsonOutput),
}

impl OutputWriter {
    pub fn new(format: OutputFormat, verbose: bool, quiet: bool) -> Self {
        match format {
            OutputFormat::Text => OutputWriter::Text(TerminalOutput::new(verbose, quiet)),
            OutputFormat::Json => OutputWriter::Json(JsonOutput::new(verbose)),
        }
    }

    pub fn print_batch_header(&self, hosts: usize, commands: usize, tunnel: Option<&str>) {
        match self {
            OutputWriter::Text(output) => output.print_batch_header(hosts, commands, tunnel),
            OutputWriter::Json(_) => {}
        }
    }

    pub fn create_batch_progress(&self, hosts: usize) -> ProgressBar {
        match self {
            OutputWriter::Text(output) => output.create_batch_progress(hosts),
            OutputWriter::Json(_) => ProgressBar::hidden(),
        }
    }

    pub fn print_progress(&self, bar: &ProgressBar, event: &ProgressEvent) {
        match self {
            OutputWriter::Text(output) => output.print_progress(bar, event),
            OutputWriter::Json(output) => output.print_progress(event),
        }
    }

    pub fn print_batch(&self, batch: &BatchResult) {
        match self {
            OutputWriter::Text(output) => output.print_batch(batch),
            OutputWriter::Json(output) => output.print_batch(batch),
        }
    }
}
