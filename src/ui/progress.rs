use std::io::IsTerminal;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

fn visible(hidden: bool) -> bool {
    !hidden && std::io::stderr().is_terminal()
}

/// Progress bar over `total` units; hidden when stderr is not a terminal.
pub fn bounded_bar(total: u64, message: &str, unit_label: &str, hidden: bool) -> ProgressBar {
    if !visible(hidden) {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total);
    let template = format!(
        "{{spinner:.cyan}} {{prefix}} [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {unit_label} ({{percent:>3}}%) | {{msg}}"
    );
    pb.set_style(ProgressStyle::with_template(&template).unwrap_or_else(|_| ProgressStyle::default_bar()));
    pb.set_prefix(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn format_duration(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    if hours > 0 {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}

pub fn format_usize_commas(value: usize) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(format_duration(59), "00:59");
        assert_eq!(format_duration(3 * 3600 + 62), "03:01:02");
    }

    #[test]
    fn thousands_separators() {
        assert_eq!(format_usize_commas(0), "0");
        assert_eq!(format_usize_commas(999), "999");
        assert_eq!(format_usize_commas(1_234_567), "1,234,567");
    }

    #[test]
    fn hidden_bars_stay_hidden() {
        assert!(bounded_bar(10, "Importing", "records", true).is_hidden());
    }
}
