use crate::pool::PoolStatus;
use crate::registry::RegistryStats;

/// One `key=value` line per field, per purpose prefixed by the purpose name.
pub fn format_pool_status(status: &PoolStatus) -> String {
    let mut lines = vec![
        format!("running={}", status.running),
        format!("endpoint={}", status.endpoint),
        format!("total_sessions={}", status.total_sessions),
        format!("total_in_use={}", status.total_in_use),
    ];

    for (purpose, s) in &status.per_purpose {
        lines.push(format!(
            "{purpose}.total={} {purpose}.in_use={} {purpose}.idle={} {purpose}.pending={} {purpose}.healthy={} {purpose}.max={}",
            s.total, s.in_use, s.idle, s.pending, s.healthy, s.max_concurrent
        ));
    }
    lines.join("\n")
}

pub fn format_registry_stats(stats: &RegistryStats) -> String {
    let mut lines = vec![
        format!("allocated={}", stats.total_allocated),
        format!("active={}", stats.total_active),
        format!("total_allocations={}", stats.counters.total_allocations),
        format!("total_deallocations={}", stats.counters.total_deallocations),
        format!("stale_reclaimed={}", stats.counters.stale_reclaimed),
        format!("exhausted={}", stats.counters.exhausted),
    ];

    for (purpose, usage) in &stats.by_purpose {
        lines.push(format!(
            "{purpose}.allocated={}/{} {purpose}.active={} {purpose}.max={}",
            usage.allocated, usage.range_size, usage.active, usage.max_concurrent
        ));
    }

    match &stats.state_file {
        Some(path) => lines.push(format!("state_file={}", path.display())),
        None => lines.push("state_file=<memory>".to_string()),
    }
    if let Some(err) = &stats.last_save_error {
        lines.push(format!("last_save_error={err}"));
    }
    lines.join("\n")
}
