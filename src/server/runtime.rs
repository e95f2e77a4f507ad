/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Order: `MDGATE_CPU_LIMIT` env override ("4" or "4000m"), cgroup v2
/// `cpu.max`, cgroup v1 quota/period, then host parallelism. Without this,
/// tokio sizes for the host CPU count and over-provisions threads inside a
/// limited container.
pub fn get_container_cpu_limit() -> usize {
    if let Ok(raw) = std::env::var("MDGATE_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&raw) {
            return cores.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_quota_period(&max.split_whitespace().collect::<Vec<_>>().join(" ")) {
            return cores.max(1);
        }
    }

    if let (Ok(quota), Ok(period)) = (
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us"),
        std::fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us"),
    ) {
        let joined = format!("{} {}", quota.trim(), period.trim());
        if let Some(cores) = parse_quota_period(&joined) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    match value.strip_suffix('m') {
        Some(millis) => millis.parse::<usize>().ok().map(|m| m / 1000),
        None => value.parse::<usize>().ok(),
    }
}

/// "quota period" pair; "max" means unlimited.
fn parse_quota_period(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    if quota > 0 && period > 0 {
        Some((quota / period) as usize)
    } else {
        None
    }
}
