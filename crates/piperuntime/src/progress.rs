//! Progress side-channel carried in captured stdout.
//!
//! Code running on a kernel reports progress by printing
//! `__pipe_progress__(<fraction>)__`; the runner scans for the marker.

const PREFIX: &str = "__pipe_progress__(";
const SUFFIX: &str = ")__";

/// Render the marker for `fraction`.
pub fn marker(fraction: f64) -> String {
    format!("{}{}{}", PREFIX, fraction, SUFFIX)
}

/// Last well-formed marker in `text`, as (byte offset just past it, fraction
/// clamped to 0..=1).
pub fn latest(text: &str) -> Option<(usize, f64)> {
    let mut found = None;
    let mut from = 0;

    while let Some(start) = text[from..].find(PREFIX) {
        let body_start = from + start + PREFIX.len();
        let Some(len) = text[body_start..].find(SUFFIX) else {
            break;
        };
        let end = body_start + len + SUFFIX.len();
        if let Ok(fraction) = text[body_start..body_start + len].trim().parse::<f64>() {
            if fraction.is_finite() {
                found = Some((end, fraction.clamp(0.0, 1.0)));
            }
        }
        from = end;
    }

    found
}
