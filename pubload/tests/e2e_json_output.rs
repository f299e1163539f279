use std::io::Write as _;
use std::process::Command;

use anyhow::Context as _;
use serde_json::Value;

fn json_lines(stdout: &[u8]) -> anyhow::Result<Vec<Value>> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("not json: {l}")))
        .collect()
}

#[test]
fn json_output_emits_progress_then_summary() -> anyhow::Result<()> {
    let exe = env!("CARGO_BIN_EXE_pubload");
    let out = Command::new(exe)
        .args([
            "run",
            "--backend",
            "pubsub",
            "--rate",
            "40",
            "--workers",
            "2",
            "--duration",
            "1s",
            "--progress-interval",
            "200ms",
            "--poll-timeout",
            "20ms",
            "--output",
            "json",
        ])
        .output()
        .context("run pubload binary")?;

    anyhow::ensure!(
        out.status.success(),
        "status {:?}\nstderr:\n{}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );

    let lines = json_lines(&out.stdout)?;
    let kinds: Vec<&str> = lines
        .iter()
        .filter_map(|v| v.get("kind").and_then(Value::as_str))
        .collect();
    anyhow::ensure!(kinds.contains(&"progress"), "kinds: {kinds:?}");
    anyhow::ensure!(kinds.last() == Some(&"summary"), "kinds: {kinds:?}");

    let summary = lines
        .last()
        .context("no output lines")?;
    anyhow::ensure!(
        summary.get("metric").and_then(Value::as_str) == Some("end_to_end_latency"),
        "{summary}"
    );
    anyhow::ensure!(
        summary.get("stop_reason").and_then(Value::as_str) == Some("duration_elapsed"),
        "{summary}"
    );
    let workers = summary
        .get("workers")
        .and_then(Value::as_array)
        .context("workers missing")?;
    anyhow::ensure!(workers.len() == 2, "{summary}");
    Ok(())
}

#[test]
fn run_file_settings_are_applied() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    writeln!(file, "rate: 20")?;
    writeln!(file, "workers: 2")?;
    writeln!(file, "duration: 500ms")?;
    writeln!(file, "disable_progress: true")?;
    writeln!(file, "topic: from-file")?;

    let exe = env!("CARGO_BIN_EXE_pubload");
    let out = Command::new(exe)
        .arg("run")
        .arg("--config")
        .arg(file.path())
        .args(["--workers", "1", "--output", "json"])
        .output()
        .context("run pubload binary")?;

    anyhow::ensure!(
        out.status.success(),
        "status {:?}\nstderr:\n{}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );

    let lines = json_lines(&out.stdout)?;
    anyhow::ensure!(lines.len() == 1, "expected only the summary line: {lines:?}");
    let summary = &lines[0];
    anyhow::ensure!(
        summary.get("target_rate").and_then(Value::as_f64) == Some(20.0),
        "{summary}"
    );
    // The flag wins over the file.
    anyhow::ensure!(
        summary
            .get("workers")
            .and_then(Value::as_array)
            .map(Vec::len)
            == Some(1),
        "{summary}"
    );
    Ok(())
}

#[test]
fn subscribe_run_consumes_the_feed() -> anyhow::Result<()> {
    let exe = env!("CARGO_BIN_EXE_pubload");
    let out = Command::new(exe)
        .args([
            "run",
            "--backend",
            "subscribe",
            "--rate",
            "20",
            "--workers",
            "2",
            "--duration",
            "1s",
            "--poll-timeout",
            "50ms",
            "--feed-rate",
            "200",
            "--no-progress",
            "--output",
            "json",
        ])
        .output()
        .context("run pubload binary")?;

    anyhow::ensure!(
        out.status.success(),
        "status {:?}\nstderr:\n{}",
        out.status,
        String::from_utf8_lossy(&out.stderr)
    );

    let lines = json_lines(&out.stdout)?;
    let summary = lines.last().context("no output lines")?;
    let messages = summary
        .get("messages_total")
        .and_then(Value::as_u64)
        .context("messages_total missing")?;
    anyhow::ensure!(messages > 0, "{summary}");
    anyhow::ensure!(
        summary.get("latency").is_some_and(|l| !l.is_null()),
        "{summary}"
    );
    Ok(())
}
