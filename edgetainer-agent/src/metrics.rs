//! Host metrics
//!
//! Lightweight readings from /proc for heartbeats and status responses.
//! Every field is best-effort: a missing or unparsable file just leaves the
//! field empty.

use edgetainer_protocol::SystemMetrics;

/// Collect current host metrics.
pub fn collect() -> SystemMetrics {
    let mut metrics = SystemMetrics::default();

    if let Ok(loadavg) = std::fs::read_to_string("/proc/loadavg") {
        metrics.load_1m = parse_loadavg(&loadavg);
    }
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        let (total, available) = parse_meminfo(&meminfo);
        metrics.mem_total_kb = total;
        metrics.mem_available_kb = available;
    }
    if let Ok(uptime) = std::fs::read_to_string("/proc/uptime") {
        metrics.uptime_secs = parse_uptime(&uptime);
    }

    metrics
}

fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo(contents: &str) -> (Option<u64>, Option<u64>) {
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok());
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().split_whitespace().next().and_then(|v| v.parse().ok());
        }
    }
    (total, available)
}

fn parse_uptime(contents: &str) -> Option<u64> {
    let seconds: f64 = contents.split_whitespace().next()?.parse().ok()?;
    Some(seconds as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_loadavg() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 1/467 31337\n"), Some(0.52));
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("garbage"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let contents = "MemTotal:       16384256 kB\nMemFree:         1234567 kB\nMemAvailable:    8192128 kB\n";
        let (total, available) = parse_meminfo(contents);
        assert_eq!(total, Some(16384256));
        assert_eq!(available, Some(8192128));
    }

    #[test]
    fn test_parse_meminfo_partial() {
        let (total, available) = parse_meminfo("MemTotal: 1024 kB\n");
        assert_eq!(total, Some(1024));
        assert_eq!(available, None);
    }

    #[test]
    fn test_parse_uptime() {
        assert_eq!(parse_uptime("351735.13 2552182.70\n"), Some(351735));
        assert_eq!(parse_uptime("bad"), None);
    }
}
