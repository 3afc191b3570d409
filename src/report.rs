//! Human-readable `performanceReport()` rendering.
//!
//! Pure formatting over data `Cores` already tracks; grounded on the
//! teacher's `bench.rs::print_device_table`/`print_combined_table` column
//! layout (name, percentage-of-total, latency, sorted by descending time).

use crate::device::MemoryPolicy;

/// Renders the per-device share/latency/memory-policy table for one
/// compute-id, in the column order spec.md §6 names: "percent share,
/// latency ms, and memory policy `gddr`|`stream`".
pub fn render(
    compute_id: i64,
    device_names: &[String],
    memory_policies: &[MemoryPolicy],
    ranges: &[u64],
    benchmarks: &[f64],
) -> String {
    let total_range: u64 = ranges.iter().sum();
    let mut rows: Vec<usize> = (0..device_names.len()).collect();
    rows.sort_by(|&a, &b| {
        benchmarks
            .get(b)
            .copied()
            .unwrap_or(0.0)
            .partial_cmp(&benchmarks.get(a).copied().unwrap_or(0.0))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = format!("performance report (compute-id {compute_id}):\n");
    for i in rows {
        let pct = if total_range == 0 {
            0.0
        } else {
            ranges[i] as f64 / total_range as f64 * 100.0
        };
        let ms = benchmarks.get(i).copied().unwrap_or(0.0);
        let policy = memory_policies
            .get(i)
            .map(|p| p.label())
            .unwrap_or("stream");
        out += &format!(
            "  [{i}] {:<28} {:>6.2}%  {:>9.3} ms  {policy}\n",
            device_names[i], pct, ms
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_sorted_by_descending_latency() {
        let names = vec!["cpu0".to_string(), "gpu0".to_string()];
        let policies = vec![MemoryPolicy::PinnedHost, MemoryPolicy::Streaming];
        let ranges = vec![1024u64, 3072u64];
        let benchmarks = vec![5.0, 15.0];
        let report = render(7, &names, &policies, &ranges, &benchmarks);
        let gpu_pos = report.find("gpu0").unwrap();
        let cpu_pos = report.find("cpu0").unwrap();
        assert!(gpu_pos < cpu_pos, "higher-latency device should sort first");
        assert!(report.contains("75.00%"));
        assert!(report.contains("stream"));
        assert!(report.contains("gddr"));
    }

    #[test]
    fn zero_total_range_does_not_divide_by_zero() {
        let names = vec!["cpu0".to_string()];
        let policies = vec![MemoryPolicy::PinnedHost];
        let report = render(1, &names, &policies, &[0], &[0.0]);
        assert!(report.contains("0.00%"));
    }
}
