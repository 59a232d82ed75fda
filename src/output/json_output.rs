// JSON output for machine consumption

use serde_json::json;

use super::events::ProgressEvent;
use crate::executor::BatchResult;

/// Streams progress as NDJSON on stderr and prints the batch result verbatim
pub struct JsonOutput {
    verbose: bool,
}

impl JsonOutput {
    pub fn new(verbose: bool) -> Self {
        JsonOutput { verbose }
    }

    pub fn print_progress(&self, event: &ProgressEvent) {
        if !self.verbose {
            return;
        }
        if let Ok(line) = serde_json::to_string(&json!({ "event": "progress", "data": event })) {
            eprintln!("{}", line);
        }
    }

    /// The batch exactly as callers receive it: one object per host
    pub fn render_batch(&self, batch: &BatchResult) -> serde_json::Result<String> {
        serde_json::to_string_pretty(batch)
    }

    pub fn print_batch(&self, batch: &BatchResult) {
        match self.render_batch(batch) {
            Ok(text) => println!("{}", text),
            Err(e) => eprintln!("failed to serialize results: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{CommandResult, HostExecutionResult};
    use crate::output::errors::{ExecError, Stage};

    #[test]
    fn test_render_batch_shape() {
        let mut ok = HostExecutionResult::new("web1");
        ok.commands.push(CommandResult {
            command: "echo hi".to_string(),
            exit_code: Some(0),
            signal: None,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
            all: "hi\n".to_string(),
        });
        let failed = HostExecutionResult::failed(
            "web2",
            ExecError::transport(Stage::Target, "web2", "connection refused"),
        );
        let batch = BatchResult {
            hosts: vec![ok, failed],
        };

        let text = JsonOutput::new(false).render_batch(&batch).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value.as_array().map(Vec::len), Some(2));
        assert_eq!(value[0]["commands"][0]["code"], 0);
        assert_eq!(value[0]["commands"][0]["all"], "hi\n");
        assert_eq!(value[1]["error"]["kind"], "transport");
        assert_eq!(value[1]["commands"].as_array().map(Vec::len), Some(0));
    }
}
