//! Inline memory markers (`#canon`, `#client_fact`, `#working_memory`).
//!
//! Routing is a total mapping: every marker, known or not, resolves to a
//! layer, and a message without markers lands in working memory.

use crate::schema::MemoryLayer;

pub const MARKER_CANON: &str = "#canon";
pub const MARKER_CLIENT_FACT: &str = "#client_fact";
pub const MARKER_WORKING: &str = "#working_memory";

/// Layer a single marker routes to.  Unknown markers default to working memory.
pub fn route_marker(marker: &str) -> MemoryLayer {
    match marker.trim().to_ascii_lowercase().as_str() {
        MARKER_CANON => MemoryLayer::Canon,
        MARKER_CLIENT_FACT => MemoryLayer::ClientProfile,
        _ => MemoryLayer::Working,
    }
}

fn is_recognised(marker: &str) -> bool {
    matches!(
        marker.to_ascii_lowercase().as_str(),
        MARKER_CANON | MARKER_CLIENT_FACT | MARKER_WORKING
    )
}

/// A message after marker extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedMessage {
    pub layer: MemoryLayer,
    /// Message text with recognised markers removed.  Unknown hashtags stay.
    pub content: String,
    /// Every `#word` token found, in order of appearance.
    pub markers: Vec<String>,
}

/// Scan `text` for markers and pick the destination layer.
///
/// When several markers appear the most durable layer wins:
/// canon, then client profile, then working memory.
pub fn route_message(text: &str) -> RoutedMessage {
    let mut markers = Vec::new();
    let mut kept = Vec::new();

    for token in text.split_whitespace() {
        let bare = token.trim_end_matches(|c: char| matches!(c, '.' | ',' | '!' | '?' | ';' | ':'));
        if bare.len() > 1
            && bare.starts_with('#')
            && bare[1..].chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-')
        {
            markers.push(bare.to_string());
            if is_recognised(bare) {
                continue;
            }
        }
        kept.push(token);
    }

    let layer = markers
        .iter()
        .map(|marker| route_marker(marker))
        .min_by_key(|layer| match layer {
            MemoryLayer::Canon => 0,
            MemoryLayer::ClientProfile => 1,
            _ => 2,
        })
        .unwrap_or(MemoryLayer::Working);

    RoutedMessage {
        layer,
        content: kept.join(" "),
        markers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_markers_route_to_their_layers() {
        assert_eq!(route_marker("#canon"), MemoryLayer::Canon);
        assert_eq!(route_marker("#CANON"), MemoryLayer::Canon);
        assert_eq!(route_marker("#client_fact"), MemoryLayer::ClientProfile);
        assert_eq!(route_marker("#working_memory"), MemoryLayer::Working);
    }

    #[test]
    fn unknown_markers_default_to_working() {
        assert_eq!(route_marker("#rustlang"), MemoryLayer::Working);
        assert_eq!(route_marker(""), MemoryLayer::Working);
    }

    #[test]
    fn canon_marker_is_stripped_from_content() {
        let routed = route_message("I resolved the scheduling conflict #canon");
        assert_eq!(routed.layer, MemoryLayer::Canon);
        assert_eq!(routed.content, "I resolved the scheduling conflict");
        assert_eq!(routed.markers, vec!["#canon"]);
    }

    #[test]
    fn unmarked_message_is_working_memory() {
        let routed = route_message("just chatting");
        assert_eq!(routed.layer, MemoryLayer::Working);
        assert_eq!(routed.content, "just chatting");
        assert!(routed.markers.is_empty());
    }

    #[test]
    fn unknown_hashtag_is_kept_in_content() {
        let routed = route_message("shipping the #release today");
        assert_eq!(routed.layer, MemoryLayer::Working);
        assert_eq!(routed.content, "shipping the #release today");
        assert_eq!(routed.markers, vec!["#release"]);
    }

    #[test]
    fn most_durable_marker_wins() {
        let routed = route_message("#working_memory my name is Sam #client_fact #canon");
        assert_eq!(routed.layer, MemoryLayer::Canon);
        assert_eq!(routed.content, "my name is Sam");
    }

    #[test]
    fn trailing_punctuation_does_not_hide_marker() {
        let routed = route_message("remember this #client_fact.");
        assert_eq!(routed.layer, MemoryLayer::ClientProfile);
        assert_eq!(routed.content, "remember this");
    }
}
