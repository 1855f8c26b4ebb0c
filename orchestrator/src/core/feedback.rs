//! Feedback prompt composition from CI failure logs.
//!
//! Deterministic: the same logs and the same limits always produce the same
//! prompt. Raw logs of arbitrary size are tail-truncated to a byte budget
//! (preserving line boundaries where possible) and wrapped in a fixed
//! template; the rendered output is clamped to a hard ceiling.

use minijinja::{context, Environment};
use serde::{Deserialize, Serialize};

const RETRY_TEMPLATE: &str = include_str!("prompts/retry.md");

/// Byte bounds for feedback prompt composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackLimits {
    /// Keep only the last this-many bytes of the failure logs.
    pub truncate_bytes: usize,
    /// Hard ceiling on the rendered prompt.
    pub max_bytes: usize,
}

impl Default for FeedbackLimits {
    fn default() -> Self {
        Self {
            truncate_bytes: 4096,
            max_bytes: 8 * 1024,
        }
    }
}

/// Compose the next prompt from raw CI failure logs.
pub fn compose_retry_prompt(failure_logs: &[u8], limits: &FeedbackLimits) -> String {
    let excerpt = tail_lines(failure_logs, limits.truncate_bytes);

    let mut env = Environment::new();
    env.add_template("retry", RETRY_TEMPLATE)
        .expect("retry template should be valid");
    let rendered = env
        .get_template("retry")
        .expect("retry template is registered")
        .render(context! { excerpt => excerpt.trim_end() })
        .expect("retry template rendering should not fail");

    clamp(rendered, limits.max_bytes)
}

/// Take the last `budget` bytes of `raw` as lossy UTF-8, starting at the
/// first full line inside the window when one exists.
fn tail_lines(raw: &[u8], budget: usize) -> String {
    if raw.len() <= budget {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let cut = raw.len() - budget;
    let window = &raw[cut..];
    // Skip the partial first line unless the window is a single line.
    let start = match window.iter().position(|&b| b == b'\n') {
        Some(pos) if pos + 1 < window.len() => pos + 1,
        _ => 0,
    };
    String::from_utf8_lossy(&window[start..]).into_owned()
}

/// Clamp to `max_bytes`, marking the cut.
fn clamp(mut text: String, max_bytes: usize) -> String {
    const MARKER: &str = "\n[truncated]";
    if text.len() <= max_bytes {
        return text;
    }
    let keep = max_bytes.saturating_sub(MARKER.len());
    let mut end = keep;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str(MARKER);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_starts_with_failure_banner() {
        let prompt = compose_retry_prompt(b"FAIL test_login", &FeedbackLimits::default());
        assert!(prompt.starts_with("CI failed:"), "got: {prompt}");
        assert!(prompt.contains("test_login"));
    }

    /// Same logs, same limits: identical output.
    #[test]
    fn composition_is_deterministic() {
        let logs = b"error[E0308]: mismatched types\n --> src/lib.rs:10:5\n";
        let limits = FeedbackLimits::default();
        assert_eq!(
            compose_retry_prompt(logs, &limits),
            compose_retry_prompt(logs, &limits)
        );
    }

    #[test]
    fn tail_keeps_whole_input_under_budget() {
        assert_eq!(tail_lines(b"a\nb\nc", 100), "a\nb\nc");
    }

    #[test]
    fn tail_starts_at_a_line_boundary() {
        let logs = b"line one is long\nline two\nline three\n";
        let tail = tail_lines(logs, 22);
        assert_eq!(tail, "line two\nline three\n");
    }

    #[test]
    fn tail_falls_back_to_mid_line_for_single_long_line() {
        let logs = b"abcdefghijklmnopqrstuvwxyz";
        let tail = tail_lines(logs, 5);
        assert_eq!(tail, "vwxyz");
    }

    #[test]
    fn output_respects_ceiling() {
        let logs = vec![b'x'; 64 * 1024];
        let limits = FeedbackLimits {
            truncate_bytes: 32 * 1024,
            max_bytes: 1024,
        };
        let prompt = compose_retry_prompt(&logs, &limits);
        assert!(prompt.len() <= 1024, "len = {}", prompt.len());
        assert!(prompt.ends_with("[truncated]"));
    }

    #[test]
    fn handles_invalid_utf8() {
        let logs = [b'o', b'k', 0xff, 0xfe, b'\n', b'f', b'a', b'i', b'l'];
        let prompt = compose_retry_prompt(&logs, &FeedbackLimits::default());
        assert!(prompt.contains("fail"));
    }
}
