//! Progress bar and summary reporting for CLI commands.

use chrono::Utc;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::AppConfig;
use crate::format::{format_age, format_bytes, format_duration};
use crate::manager::{ActivationReport, InstallProgress};
use crate::state::{Registration, WorkerRecord};
use crate::worker::{CacheListing, InstallOutcome};

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Precache progress: one tick per fetched URL.
pub struct InstallBar {
    bar: ProgressBar,
}

impl InstallBar {
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌");
        bar.set_style(style);
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl InstallProgress for InstallBar {
    fn on_install_start(&self, cache: &str, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_message(cache.to_string());
    }

    fn on_fetched(&self, url: &str, bytes: u64) {
        self.bar.inc(1);
        self.bar
            .println(format!("  {} {url} ({})", style("✓").green(), format_bytes(bytes)));
    }

    fn on_error(&self, url: &str, error: &str) {
        self.bar
            .println(format!("  {} {url}: {error}", style("✗").red()));
    }
}

pub fn print_install_summary(outcome: &InstallOutcome) {
    let report = &outcome.report;
    println!("\n{SEPARATOR}");
    println!("Install Summary");
    println!("{SEPARATOR}");
    println!("  Cache:             {}", report.cache_name);
    println!("  Entries:           {}", report.entries);
    println!("  Total size:        {}", format_bytes(report.bytes));
    println!("  Total time:        {}", format_duration(report.elapsed));
    match &outcome.activation {
        Some(activation) => {
            println!("  Activated:         yes");
            println!("  Stale caches:      {}", activation.deleted.len());
        }
        None => println!("  Activated:         no (waiting, run `giftcache activate`)"),
    }
    println!("{SEPARATOR}");
}

pub fn print_activation(report: &ActivationReport) {
    println!("Activated {}", style(&report.cache_name).green());
    for name in &report.deleted {
        println!("  removed {name}");
    }
    for name in &report.failed {
        println!("  {} could not remove {name}", style("!").yellow());
    }
}

fn describe(record: Option<&WorkerRecord>) -> String {
    record.map_or_else(
        || "-".to_string(),
        |w| format!("{} ({:?}, installed {})", w.version, w.state, w.installed_at.format("%Y-%m-%d %H:%M")),
    )
}

pub fn print_status(config: &AppConfig, registration: &Registration, caches: &[CacheListing]) {
    let now = Utc::now();

    println!("\n{SEPARATOR}");
    println!("giftcache status");
    println!("{SEPARATOR}");
    println!("  Origin:            {}", config.origin.url);
    println!("  Strategy:          {}", config.cache.strategy);
    println!("  Configured cache:  {}", config.cache.cache_name());
    println!("  Active:            {}", describe(registration.active.as_ref()));
    println!("  Waiting:           {}", describe(registration.waiting.as_ref()));
    if registration.installing.is_some() {
        println!("  Installing:        {}", describe(registration.installing.as_ref()));
    }
    println!("  Last redundant:    {}", describe(registration.redundant.as_ref()));
    println!(
        "  Controlling:       {}",
        if registration.controlling { "yes" } else { "no" }
    );
    println!("{SEPARATOR}");

    if caches.is_empty() {
        println!("  No caches stored in {}", config.paths.cache_dir.display());
    }
    for cache in caches {
        let size: u64 = cache.entries.iter().map(|e| e.size).sum();
        let marker = if cache.current { style("*").green() } else { style(" ") };
        println!(
            "{marker} {} ({} entries, {})",
            cache.name,
            cache.entries.len(),
            format_bytes(size)
        );
        for entry in &cache.entries {
            println!(
                "    {} {} {} ({}, {})",
                entry.key.method,
                entry.key.url,
                entry.status,
                format_bytes(entry.size),
                format_age(entry.stored_at, now)
            );
        }
    }
    println!("{SEPARATOR}");
}
