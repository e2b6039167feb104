use colored::{ColoredString, Colorize};
use workflow::{SkipReason, StageStatus};

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.chars().count()).dimmed());
}

/// Print a section header
pub fn section(title: &str) {
    println!();
    println!("{}", title.cyan().bold());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// One-character marker for a stage status
pub fn status_symbol(status: &StageStatus) -> ColoredString {
    match status {
        StageStatus::Pending => "·".dimmed(),
        StageStatus::Running => "▸".blue(),
        StageStatus::Succeeded => "✓".green(),
        StageStatus::Failed => "✗".red(),
        StageStatus::Skipped {
            reason: SkipReason::UpstreamFailure { .. },
        } => "⊘".yellow(),
        StageStatus::Skipped { .. } => "○".cyan(),
        StageStatus::Cancelled => "■".yellow(),
    }
}

/// Format a duration as `1.2s` or `3m04s`
pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    if millis < 60_000 {
        format!("{:.1}s", millis as f64 / 1000.0)
    } else {
        let secs = millis / 1000;
        format!("{}m{:02}s", secs / 60, secs % 60)
    }
}

const KB: u64 = 1024;
const MB: u64 = KB * 1024;

/// Format a byte count as human-readable size
pub fn format_size(bytes: u64) -> String {
    if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

/// Last `max` lines of captured output
pub fn tail(text: &str, max: usize) -> Vec<&str> {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(max)..].to_vec()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(chrono::Duration::milliseconds(0)), "0.0s");
        assert_eq!(format_duration(chrono::Duration::milliseconds(1500)), "1.5s");
        assert_eq!(format_duration(chrono::Duration::seconds(184)), "3m04s");
        assert_eq!(format_duration(chrono::Duration::seconds(-5)), "0.0s");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(3 * MB), "3.0 MB");
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\nc\n", 2), vec!["b", "c"]);
        assert_eq!(tail("a", 5), vec!["a"]);
        assert!(tail("", 3).is_empty());
    }
}
