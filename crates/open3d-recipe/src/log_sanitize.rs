use std::sync::LazyLock;

use regex::Regex;

const MAX_LOG_CHARS: usize = 4096;

// CSI, OSC (BEL or ST terminated), then any other two-byte escape.
static ANSI_ESCAPE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]").ok()
});

pub fn sanitize_log_line(input: &str) -> String {
    let stripped = match ANSI_ESCAPE.as_ref() {
        Some(re) => re.replace_all(input, ""),
        None => input.into(),
    };

    let mut out = String::with_capacity(stripped.len().min(MAX_LOG_CHARS));
    let mut kept = stripped
        .chars()
        .filter(|&c| c == '\t' || !(c.is_control() || is_bidi_control(c)))
        .map(|c| if c == '\t' { ' ' } else { c });
    out.extend(kept.by_ref().take(MAX_LOG_CHARS));
    if kept.next().is_some() {
        out.push_str(" ...[truncated]");
    }
    out
}

fn is_bidi_control(c: char) -> bool {
    matches!(c, '\u{061C}' | '\u{200E}' | '\u{200F}')
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::sanitize_log_line;

    #[test]
    fn strips_color_and_title_sequences() {
        let input = "-- \u{1b}[1;32mConfiguring done\u{1b}[0m \u{1b}]0;cmake\u{7}(1.2s)";
        assert_eq!(sanitize_log_line(input), "-- Configuring done (1.2s)");
    }

    #[test]
    fn strips_controls_and_expands_tabs() {
        assert_eq!(sanitize_log_line("a\tb\rc\u{202e}d"), "a bcd");
    }

    #[test]
    fn long_lines_are_truncated() {
        let line = "x".repeat(5000);
        let out = sanitize_log_line(&line);
        assert!(out.ends_with("...[truncated]"));
        assert!(out.len() < 5000);
    }

    #[test]
    fn line_at_the_limit_is_kept_whole() {
        let line = "y".repeat(4096);
        assert_eq!(sanitize_log_line(&line), line);
        let with_control = format!("{line}\u{7}");
        assert_eq!(sanitize_log_line(&with_control), line);
    }
}
