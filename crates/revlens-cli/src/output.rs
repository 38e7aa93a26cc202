use std::io::Write;

use owo_colors::OwoColorize;
use revlens_core::{JanitorReport, ReviewSetMetadata, StorageInfo, StoreCounts, StoreLocation};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn heading(w: &mut dyn Write, title: &str, color: ColorMode) -> std::io::Result<()> {
    let sep = "=".repeat(60);
    if color.enabled() {
        writeln!(w, "{}", sep.bold())?;
        writeln!(w, "{}", title.bold())?;
        writeln!(w, "{}", sep.bold())?;
    } else {
        writeln!(w, "{}", sep)?;
        writeln!(w, "{}", title)?;
        writeln!(w, "{}", sep)?;
    }
    Ok(())
}

fn dimmed_line(w: &mut dyn Write, msg: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "  {}", msg.dimmed())
    } else {
        writeln!(w, "  {}", msg)
    }
}

/// Print store location, row counts and storage usage.
pub fn print_storage_report(
    w: &mut dyn Write,
    location: &StoreLocation,
    counts: &StoreCounts,
    info: &StorageInfo,
    color: ColorMode,
) -> std::io::Result<()> {
    heading(w, "DURABLE CACHE", color)?;
    match location {
        StoreLocation::File(path) => writeln!(w, "  Location: {}", path.display())?,
        StoreLocation::Memory => writeln!(w, "  Location: (in-memory)")?,
    }
    writeln!(w)?;
    writeln!(w, "  Review sets: {}", counts.review_sets)?;
    writeln!(w, "  Metadata rows: {}", counts.metadata)?;
    writeln!(w, "  Analyses: {}", counts.analyses)?;
    writeln!(w)?;

    if info.supported {
        writeln!(w, "  Usage: {}", human_bytes(info.usage_bytes))?;
        dimmed_line(w, &format!("Quota: {}", human_bytes(info.quota_bytes)), color)?;
    } else {
        dimmed_line(w, "Storage usage unavailable", color)?;
    }
    writeln!(w)?;
    Ok(())
}

/// Print the summary of one archived review set.
pub fn print_metadata(
    w: &mut dyn Write,
    meta: &ReviewSetMetadata,
    color: ColorMode,
) -> std::io::Result<()> {
    heading(w, &format!("REVIEW SET {}", meta.app_id), color)?;
    writeln!(w, "  Territory: {}", meta.territory)?;
    writeln!(w, "  Reviews: {}", meta.review_count)?;
    writeln!(
        w,
        "  Last updated: {}",
        meta.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    match (meta.oldest_review, meta.newest_review) {
        (Some(oldest), Some(newest)) => writeln!(
            w,
            "  Date range: {} to {}",
            oldest.format("%Y-%m-%d"),
            newest.format("%Y-%m-%d")
        )?,
        _ => dimmed_line(w, "No dated reviews", color)?,
    }
    dimmed_line(w, &format!("Schema version: {}", meta.schema_version), color)?;
    writeln!(w)?;
    Ok(())
}

/// Print what a cleanup pass removed.
pub fn print_cleanup(
    w: &mut dyn Write,
    days_to_keep: u32,
    report: &JanitorReport,
    color: ColorMode,
) -> std::io::Result<()> {
    let Some(durable) = report.durable else {
        if color.enabled() {
            writeln!(w, "{}", "Cleanup failed; see log for details".red())?;
        } else {
            writeln!(w, "Cleanup failed; see log for details")?;
        }
        return Ok(());
    };

    let msg = format!("Removed data older than {} days", days_to_keep);
    if color.enabled() {
        writeln!(w, "{}", msg.green())?;
    } else {
        writeln!(w, "{}", msg)?;
    }
    writeln!(w, "  Review sets: {}", durable.reviews_removed)?;
    writeln!(w, "  Analyses: {}", durable.analyses_removed)?;
    Ok(())
}

/// Print a one-line success message.
pub fn print_done(w: &mut dyn Write, msg: &str, color: ColorMode) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{}", msg.green())
    } else {
        writeln!(w, "{}", msg)
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    #[test]
    fn human_bytes_scales() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn storage_report_without_color() {
        let mut out = Vec::new();
        let counts = StoreCounts {
            review_sets: 2,
            metadata: 2,
            analyses: 7,
        };
        let info = StorageInfo {
            usage_bytes: 4096,
            quota_bytes: 1 << 30,
            supported: true,
        };
        print_storage_report(
            &mut out,
            &StoreLocation::File("/tmp/cache.db".into()),
            &counts,
            &info,
            ColorMode(false),
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Location: /tmp/cache.db"));
        assert!(text.contains("Analyses: 7"));
        assert!(text.contains("Usage: 4.0 KiB"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn metadata_without_dates() {
        let meta = ReviewSetMetadata {
            app_id: "123".into(),
            territory: "us".into(),
            last_updated: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            review_count: 4,
            oldest_review: None,
            newest_review: None,
            schema_version: 1,
        };
        let mut out = Vec::new();
        print_metadata(&mut out, &meta, ColorMode(false)).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("REVIEW SET 123"));
        assert!(text.contains("Last updated: 2023-11-14 22:13:20 UTC"));
        assert!(text.contains("No dated reviews"));
    }
}
