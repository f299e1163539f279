use std::time::Duration;

pub(crate) fn format_bytes(b: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;

    if b >= MIB {
        return format!("{:.2}MiB", (b as f64) / (MIB as f64));
    }
    if b >= KIB {
        return format!("{:.2}KiB", (b as f64) / (KIB as f64));
    }

    format!("{b}B")
}

pub(crate) fn format_rate(v: f64) -> String {
    if v.is_finite() {
        format!("{v:.0}")
    } else {
        "0".to_string()
    }
}

/// Milliseconds with two decimals, `-` when there is no value.
pub(crate) fn format_ms_opt(v: Option<f64>) -> String {
    match v {
        Some(ms) if ms.is_finite() => format!("{ms:.2}ms"),
        _ => "-".to_string(),
    }
}

/// A single rounded component in one of: us, ms, s.
pub(crate) fn format_duration_single(d: Duration) -> String {
    let total_us = d.as_micros();

    // Ties round up.
    let round_div = |value: u128, unit: u128| (value + unit / 2) / unit;

    if total_us >= 1_000_000 {
        return format!("{}s", round_div(total_us, 1_000_000));
    }
    if total_us >= 1_000 {
        return format!("{}ms", round_div(total_us, 1_000));
    }
    format!("{total_us}us")
}
