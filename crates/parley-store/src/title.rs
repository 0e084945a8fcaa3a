use parley_core::text::{collapse_whitespace, truncate_str};

/// Title given to a session before its first user message is recorded.
pub const DEFAULT_TITLE: &str = "New Conversation";

/// Topic used when a request names none.
pub const DEFAULT_TOPIC: &str = "general";

/// Maximum characters kept from the first message when deriving a title.
pub const TITLE_MAX_CHARS: usize = 20;

const ELLIPSIS: char = '…';

/// Derive a session title from its first user message.
///
/// Whitespace runs collapse to single spaces; longer text is cut to
/// [`TITLE_MAX_CHARS`] characters and suffixed with `…`.
pub fn title_from_first_message(content: &str) -> String {
    let collapsed = collapse_whitespace(content);
    if collapsed.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    let cut = truncate_str(&collapsed, TITLE_MAX_CHARS);
    if cut.len() == collapsed.len() {
        collapsed
    } else {
        let mut title = cut.to_string();
        title.push(ELLIPSIS);
        title
    }
}

pub fn normalize_topic(topic: Option<&str>) -> String {
    match topic.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => DEFAULT_TOPIC.to_string(),
    }
}
