//! Progress display for apply.

use colored::Colorize;
use declarative::{ChangePlanEntry, EntryOutcome, ProgressCallback, ProviderError};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::engine::display;

/// Progress bar that prints one line per finished entry
pub struct ApplyProgress {
    bar: Option<ProgressBar>,
    quiet: bool,
}

impl ApplyProgress {
    pub fn new(quiet: bool) -> Self {
        Self { bar: None, quiet }
    }

    /// Whether every outcome was printed as it happened
    pub fn showed_outcomes(&self) -> bool {
        !self.quiet
    }

    fn println(&self, line: String) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }
}

impl ProgressCallback for ApplyProgress {
    fn on_apply_start(&mut self, total: usize) {
        if self.quiet || total == 0 {
            return;
        }
        let bar = ProgressBar::new(total as u64);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(120));
        self.bar = Some(bar);
    }

    fn on_entry_start(&mut self, entry: &ChangePlanEntry) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("{} {}", entry.action.label(), entry.address));
        }
    }

    fn on_entry_retry(
        &mut self,
        entry: &ChangePlanEntry,
        attempt: u32,
        max_attempts: u32,
        error: &ProviderError,
        delay: Duration,
    ) {
        if self.quiet {
            return;
        }
        self.println(format!(
            "  {} {} {} {}",
            "↻".yellow(),
            entry.address.to_string().bold(),
            format!("attempt {attempt}/{max_attempts} failed: {error}").yellow(),
            format!("(retrying in {:.1}s)", delay.as_secs_f64()).dimmed()
        ));
    }

    fn on_entry_complete(&mut self, entry: &ChangePlanEntry, outcome: &EntryOutcome) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        if self.quiet && !outcome.is_problem() {
            return;
        }
        self.println(format!(
            "  {} {} {}",
            display::outcome_symbol(outcome),
            entry.address.to_string().bold(),
            display::outcome_text(entry.action, outcome)
        ));
    }

    fn on_apply_complete(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
