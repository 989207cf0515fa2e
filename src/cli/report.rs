//! Human-readable output for CLI commands.

use std::time::Duration;

use console::style;

use crate::format::{format_bytes, format_duration};
use crate::stats::ResponseSource;
use crate::worker::FetchOutcome;

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Size of one cache store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSummary {
    pub name: String,
    pub entries: usize,
    pub bytes: u64,
}

/// Prints the cache stores, marking `current` as the live version.
pub fn print_caches(caches: &[CacheSummary], current: Option<&str>) {
    if caches.is_empty() {
        println!("No cache stores.");
        return;
    }

    println!("\n{SEPARATOR}");
    println!("Cache stores");
    println!("{SEPARATOR}");
    for cache in caches {
        let marker = if Some(cache.name.as_str()) == current {
            style("*").green().bold().to_string()
        } else {
            " ".to_string()
        };
        println!(
            "{marker} {} ({} entries, {})",
            cache.name,
            cache.entries,
            format_bytes(cache.bytes)
        );
    }
    println!("{SEPARATOR}");
    let total: u64 = caches.iter().map(|c| c.bytes).sum();
    println!("  {} store(s), {} total", caches.len(), format_bytes(total));
    println!("{SEPARATOR}\n");
}

/// Prints the result of an install.
pub fn print_install(version: &str, summary: Option<&CacheSummary>, elapsed: Duration) {
    let (entries, bytes) = summary.map_or((0, 0), |s| (s.entries, s.bytes));
    println!(
        "Installed {} in {}: {entries} entries, {}",
        style(version).green().bold(),
        format_duration(elapsed),
        format_bytes(bytes)
    );
}

/// Prints a fetched response: status line, headers, then the body when it is
/// text.
pub fn print_outcome(outcome: &FetchOutcome, elapsed: Duration) {
    let response = &outcome.response;
    let source = match outcome.source {
        ResponseSource::Cache => style(outcome.source.as_str()).green(),
        ResponseSource::Network => style(outcome.source.as_str()).cyan(),
        ResponseSource::Fallback => style(outcome.source.as_str()).yellow(),
        ResponseSource::Offline => style(outcome.source.as_str()).red(),
    };
    eprintln!(
        "{} {} from {source} in {}",
        style(response.status).bold(),
        response.url,
        format_duration(elapsed)
    );
    for (name, value) in &response.headers {
        eprintln!("{}: {value}", style(name).dim());
    }
    eprintln!();

    match std::str::from_utf8(&response.body) {
        Ok(text) => println!("{text}"),
        Err(_) => eprintln!("<{} binary>", format_bytes(response.body.len() as u64)),
    }
}
