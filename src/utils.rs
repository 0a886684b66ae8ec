use std::collections::BTreeSet;
use std::fmt::Display;
use std::sync::LazyLock;
use std::time::Instant;

use console::Style;
use indicatif::ProgressStyle;

const ANSI_BLUE: Style = Style::new().blue();

/// Overall run progress, attached to the scheduler span.
pub(crate) static STYLE_RUN: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .expect("Error setting progress bar template")
        .progress_chars("=>-")
});

/// Spinner shown next to each running task.
pub(crate) static STYLE_TASK: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::default_spinner()
        .template("{spinner:.blue} {msg}")
        .expect("Error setting progress bar template")
});

pub(crate) fn as_overhead(s: Instant) -> impl Display {
    let f = format!("(+{}ms)", s.elapsed().as_millis());
    ANSI_BLUE.apply_to(f)
}

/// Joins the names of running tasks into a progress bar message.
pub(crate) fn format_active(active: &BTreeSet<String>) -> String {
    const MAX: usize = 5;
    let names: Vec<&str> = active.iter().map(String::as_str).collect();

    if names.len() <= MAX {
        names.join(", ")
    } else {
        format!("{}… ({} total)", names[..MAX].join(", "), names.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_active_truncates() {
        let few: BTreeSet<String> = ["b", "a"].into_iter().map(String::from).collect();
        assert_eq!(format_active(&few), "a, b");

        let many: BTreeSet<String> = (0..7).map(|i| format!("t{i}")).collect();
        assert_eq!(format_active(&many), "t0, t1, t2, t3, t4… (7 total)");
    }
}
