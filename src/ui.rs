//! Terminal UI for a pipeline run, rendered via `indicatif` progress bars.
//!
//! Two bars are stacked vertically:
//! - Step bar — tracks how many steps have reached a terminal state
//! - Status line — spinner with the current step and live status
//!
//! All methods coordinate output via `indicatif`'s `MultiProgress`
//! internally, so log lines printed through [`TrawlerUI::print_line`] never
//! tear the bars.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

pub struct TrawlerUI {
    multi: MultiProgress,
    step_bar: ProgressBar,
    status_bar: ProgressBar,
    verbose: bool,
}

impl TrawlerUI {
    /// Create the UI and add both progress bars to the multiplex renderer.
    /// Call once at run start, before the first `start_step`.
    pub fn new(total_steps: u64, verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let step_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let step_bar = multi.add(ProgressBar::new(total_steps));
        step_bar.set_style(step_style);
        step_bar.set_prefix("Steps");

        let status_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let status_bar = multi.add(ProgressBar::new_spinner());
        status_bar.set_style(status_style);
        status_bar.set_prefix("  Now");

        Self {
            multi,
            step_bar,
            status_bar,
            verbose,
        }
    }

    /// Print a line via `MultiProgress`, falling back to `eprintln!` if the
    /// rich UI fails, so failure messages are never lost.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn start_step(&self, number: u32, name: &str) {
        self.status_bar.set_message(format!(
            "step {}: {}",
            style(number).yellow(),
            name
        ));
        self.status_bar
            .enable_steady_tick(Duration::from_millis(100));
    }

    pub fn step_completed(&self, number: u32) {
        self.status_bar.disable_steady_tick();
        self.step_bar.inc(1);
        if self.verbose {
            self.print_line(format!("  {} step {} completed", style("✓").green(), number));
        }
    }

    pub fn step_skipped(&self, number: u32, name: &str) {
        self.step_bar.inc(1);
        self.print_line(format!(
            "  {} step {} ({}) already complete, skipped",
            style("↷").dim(),
            number,
            style(name).dim()
        ));
    }

    pub fn step_failed(&self, number: u32, message: &str) {
        self.status_bar.disable_steady_tick();
        self.print_line(format!(
            "  {} step {} failed: {}",
            style("✗").red(),
            number,
            message
        ));
    }

    pub fn finish(&self, outcome: &str) {
        self.step_bar.finish_with_message(outcome.to_string());
        self.status_bar.finish_and_clear();
    }
}
