// Rich terminal output for batch runs

use std::io::IsTerminal;
use std::time::Duration;

use colored::*;
use indicatif::{ProgressBar, ProgressStyle};

use super::events::{ProgressEvent, ProgressKind};
use crate::executor::{BatchResult, HostExecutionResult};

/// Terminal output manager
pub struct TerminalOutput {
    verbose: bool,
    quiet: bool,
    is_tty: bool,
}

impl TerminalOutput {
    pub fn new(verbose: bool, quiet: bool) -> Self {
        let is_tty = std::io::stdout().is_terminal();

        // Respect NO_COLOR (https://no-color.org/) and plain pipes
        if std::env::var("NO_COLOR").is_ok() || !is_tty {
            colored::control::set_override(false);
        }

        TerminalOutput {
            verbose,
            quiet,
            is_tty,
        }
    }

    /// Print the batch header
    pub fn print_batch_header(&self, hosts: usize, commands: usize, tunnel: Option<&str>) {
        if self.quiet {
            return;
        }

        println!();
        match tunnel {
            Some(tunnel) => println!(
                "{} {} hosts, {} commands via {}",
                "RUN".green().bold(),
                hosts,
                commands,
                tunnel.cyan()
            ),
            None => println!(
                "{} {} hosts, {} commands",
                "RUN".green().bold(),
                hosts,
                commands
            ),
        }
        println!("{}", "─".repeat(60).dimmed());
    }

    /// Spinner shown while the batch is in flight
    pub fn create_batch_progress(&self, hosts: usize) -> ProgressBar {
        if self.quiet || !self.is_tty {
            return ProgressBar::hidden();
        }

        let pb = ProgressBar::new_spinner();
        let template = "{spinner:.cyan} {msg} {elapsed}";
        if let Ok(style) = ProgressStyle::default_spinner().template(template) {
            pb.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
        }
        pb.set_message(format!("running on {} hosts", hosts));
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// One line per progress event, printed above the spinner
    pub fn print_progress(&self, bar: &ProgressBar, event: &ProgressEvent) {
        if self.quiet {
            return;
        }

        let prefix = format!("[{}]", event.host).bold();
        let lines: Vec<String> = match &event.kind {
            ProgressKind::Command(command) => {
                vec![format!("{} {} {}", prefix, "$".dimmed(), command)]
            }
            ProgressKind::Stdout(chunk) if self.verbose => chunk
                .lines()
                .map(|line| format!("{} {}", prefix, line))
                .collect(),
            ProgressKind::Stderr(chunk) if self.verbose => chunk
                .lines()
                .map(|line| format!("{} {}", prefix, line.yellow()))
                .collect(),
            _ => Vec::new(),
        };

        for line in lines {
            if bar.is_hidden() {
                println!("{}", line);
            } else {
                bar.println(line);
            }
        }
    }

    fn print_host(&self, host: &HostExecutionResult) {
        let status = match (&host.error, host.nonzero_exits()) {
            (Some(_), _) => "failed".red().bold(),
            (None, 0) => "ok".green(),
            (None, _) => "nonzero".yellow(),
        };
        println!(
            "{} [{}] {} commands, {}ms",
            status,
            host.host.cyan(),
            host.commands.len(),
            host.duration_ms
        );

        if let Some(ref error) = host.error {
            println!("    {} {}", "error:".red(), error);
            if let Some(hint) = error.suggestion() {
                println!("    {}: {}", "Hint".yellow().bold(), hint);
            }
        }

        if self.quiet {
            return;
        }

        for cmd in &host.commands {
            let code = match (cmd.exit_code, &cmd.signal) {
                (_, Some(signal)) => format!("signal {}", signal).red(),
                (Some(0), None) => "0".green(),
                (Some(code), None) => code.to_string().yellow(),
                (None, None) => "-".red(),
            };
            println!("    {} {} ({})", "$".dimmed(), cmd.command, code);
            if !self.verbose {
                for line in cmd.all.lines() {
                    println!("      {}", line);
                }
            }
        }
    }

    /// Per-host report followed by a recap line
    pub fn print_batch(&self, batch: &BatchResult) {
        println!();
        for host in batch.iter() {
            self.print_host(host);
        }

        let failed = batch.failed().count();
        let nonzero = batch
            .iter()
            .filter(|h| h.is_ok() && h.nonzero_exits() > 0)
            .count();

        println!();
        println!("{}", "─".repeat(60).dimmed());
        println!(
            "{} {} hosts: {} ok, {} nonzero, {} failed",
            "RECAP".bold(),
            batch.len(),
            (batch.len() - failed - nonzero).to_string().green(),
            nonzero.to_string().yellow(),
            if failed > 0 {
                failed.to_string().red().bold()
            } else {
                failed.to_string().normal()
            }
        );
    }
}
