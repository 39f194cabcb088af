//! End-of-run summary output.

use bucketsync_replication::RunSummary;
use std::fmt::Write as _;
use std::path::Path;

/// Human-readable summary: counts first, then every failed key with its
/// reason.
pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();

    let headline = if summary.cancelled {
        "⚠️  Replication cancelled"
    } else if summary.failed > 0 {
        "⚠️  Replication finished with failures"
    } else if summary.dry_run {
        "📝 Dry run complete"
    } else {
        "✅ Replication complete"
    };
    let _ = writeln!(out, "{}", headline);
    let _ = writeln!(out, "  Objects: {}", summary.total);
    let _ = writeln!(out, "  Succeeded: {}", summary.succeeded);
    let _ = writeln!(out, "  Failed: {}", summary.failed);
    let _ = writeln!(out, "  Bytes transferred: {}", summary.bytes_transferred);
    if summary.key_collisions > 0 {
        let _ = writeln!(out, "  Key collisions: {}", summary.key_collisions);
    }
    let _ = writeln!(
        out,
        "  Time elapsed: {:.2}s",
        summary.elapsed().as_secs_f64()
    );

    if !summary.failures.is_empty() {
        let _ = writeln!(out, "\nFailed objects:");
        for failure in &summary.failures {
            let _ = writeln!(out, "  {}: {}", failure.key, failure.reason);
        }
    }

    out
}

/// Write the summary as pretty-printed JSON.
pub fn write_json(summary: &RunSummary, path: &Path) -> std::io::Result<()> {
    let json = summary.to_json_pretty().map_err(std::io::Error::other)?;
    std::fs::write(path, json)
}
