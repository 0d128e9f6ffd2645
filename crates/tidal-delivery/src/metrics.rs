//! Prometheus text exposition of controller statistics.

use std::fmt::Write;

use crate::controller::DeliveryStats;
use crate::quality::QualityLevel;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render `stats` in Prometheus text format.
pub fn render_prometheus(stats: &DeliveryStats) -> String {
    let mut out = String::with_capacity(2048);

    // ── Adaptation ──────────────────────────────────────────────

    let _ = writeln!(out, "# HELP tidal_quality_level Active quality tier (1 = active).");
    let _ = writeln!(out, "# TYPE tidal_quality_level gauge");
    for level in QualityLevel::ORDERED.iter().chain([&QualityLevel::Adaptive]) {
        let active = u8::from(*level == stats.level);
        let _ = writeln!(out, "tidal_quality_level{{level=\"{level}\"}} {active}");
    }
    metric(
        &mut out,
        "tidal_manual_override",
        "gauge",
        "Whether a manual selection pins the tier.",
        u8::from(stats.manual_override),
    );
    metric(
        &mut out,
        "tidal_quality_transitions",
        "gauge",
        "Transitions retained in history.",
        stats.transitions,
    );

    // ── Bandwidth ───────────────────────────────────────────────

    let _ = writeln!(out, "# HELP tidal_strategy Active bandwidth strategy (1 = active).");
    let _ = writeln!(out, "# TYPE tidal_strategy gauge");
    let _ = writeln!(out, "tidal_strategy{{name=\"{}\"}} 1", stats.strategy);
    metric(
        &mut out,
        "tidal_bandwidth_kbps",
        "gauge",
        "Measured throughput in kbps.",
        format_args!("{:.1}", stats.bandwidth_kbps),
    );
    metric(
        &mut out,
        "tidal_budget_kbps",
        "gauge",
        "Bandwidth available for new transfers in kbps.",
        format_args!("{:.1}", stats.budget_kbps),
    );
    metric(
        &mut out,
        "tidal_committed_kbps",
        "gauge",
        "Bandwidth committed to in-flight transfers in kbps.",
        format_args!("{:.1}", stats.committed_kbps),
    );

    // ── Transfers ───────────────────────────────────────────────

    metric(
        &mut out,
        "tidal_transfers_queued",
        "gauge",
        "Requests waiting for admission.",
        stats.queued,
    );
    metric(
        &mut out,
        "tidal_transfers_in_flight",
        "gauge",
        "Transfers currently running.",
        stats.in_flight,
    );
    metric(
        &mut out,
        "tidal_transfers_admitted_total",
        "counter",
        "Transfer attempts admitted.",
        stats.transfers_admitted,
    );
    metric(
        &mut out,
        "tidal_transfers_completed_total",
        "counter",
        "Transfers completed.",
        stats.transfers_completed,
    );
    metric(
        &mut out,
        "tidal_transfers_retried_total",
        "counter",
        "Failed attempts that were requeued.",
        stats.transfers_retried,
    );
    metric(
        &mut out,
        "tidal_transfers_failed_total",
        "counter",
        "Transfers that exhausted their retries.",
        stats.transfers_failed,
    );
    metric(
        &mut out,
        "tidal_transfers_cancelled_total",
        "counter",
        "Transfers cancelled.",
        stats.transfers_cancelled,
    );

    // ── Cache ───────────────────────────────────────────────────

    metric(
        &mut out,
        "tidal_cache_entries",
        "gauge",
        "Entries held in the content cache.",
        stats.cache_entries,
    );
    metric(
        &mut out,
        "tidal_cache_bytes",
        "gauge",
        "Bytes held in the content cache.",
        stats.cache_bytes,
    );
    metric(
        &mut out,
        "tidal_cache_max_bytes",
        "gauge",
        "Content cache size ceiling.",
        stats.cache_max_bytes,
    );
    metric(
        &mut out,
        "tidal_cache_hits_total",
        "counter",
        "Cache lookups served.",
        stats.cache_hits,
    );
    metric(
        &mut out,
        "tidal_cache_misses_total",
        "counter",
        "Cache lookups missed.",
        stats.cache_misses,
    );
    metric(
        &mut out,
        "tidal_cache_evictions_total",
        "counter",
        "Entries evicted to respect the ceiling.",
        stats.cache_evictions,
    );
    metric(
        &mut out,
        "tidal_cache_expirations_total",
        "counter",
        "Entries removed for exceeding the maximum age.",
        stats.cache_expirations,
    );

    out
}
