//! Hidden markers appended to enhanced descriptions.
//!
//! The first marker flags the issue as already enhanced. The second carries
//! the author's original notes (base64, inside an HTML comment) so a retry can
//! start from what the human wrote rather than from generated text.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

pub const ENHANCEMENT_MARKER: &str = "<!-- enhanced-by-issue-enhancer -->";
const ORIGINAL_START: &str = "<!-- original-description:";
const ORIGINAL_END: &str = ":end-original -->";

pub fn is_enhanced(description: &str) -> bool {
    description.contains(ENHANCEMENT_MARKER)
}

/// Generated text followed by both markers.
pub fn with_markers(enhanced: &str, original: &str) -> String {
    format!(
        "{}\n\n{}\n{} {} {}",
        enhanced.trim_end(),
        ENHANCEMENT_MARKER,
        ORIGINAL_START,
        STANDARD.encode(original),
        ORIGINAL_END
    )
}

/// Recover the original notes. `None` when the marker is missing or damaged.
pub fn extract_original(description: &str) -> Option<String> {
    let start = description.find(ORIGINAL_START)? + ORIGINAL_START.len();
    let end = start + description[start..].find(ORIGINAL_END)?;
    let bytes = STANDARD.decode(description[start..end].trim()).ok()?;
    String::from_utf8(bytes).ok()
}

/// The generated part of an enhanced description, markers removed.
pub fn strip_markers(description: &str) -> &str {
    match description.find(ENHANCEMENT_MARKER) {
        Some(idx) => description[..idx].trim_end(),
        None => description.trim_end(),
    }
}
