//! The two filters that only ever delete markup.

use crate::tag_scanner::{TagPattern, TagScanner};

const COMMENT_TAG: &str = "esi:comment";
const REMOVE_TAG: &str = "esi:remove";

/// Drops `<esi:comment .../>` tags.
pub fn process_comments(text: &str) -> String {
    strip_tags(text, COMMENT_TAG)
}

/// Drops `<esi:remove>...</esi:remove>` blocks together with their contents.
pub fn process_removes(text: &str) -> String {
    strip_tags(text, REMOVE_TAG)
}

// Complete tags are removed. An unfinished one keeps its opening tag.
fn strip_tags(text: &str, tagname: &str) -> String {
    let marker = format!("<{tagname}");
    if !text.contains(&marker) {
        return text.to_string();
    }
    let names = [tagname];
    let mut out = String::with_capacity(text.len());
    let mut scanner = TagScanner::new(text);
    loop {
        let (tag, before, _) = scanner.next(TagPattern::Named(&names));
        out.push_str(before);
        let Some(tag) = tag else { break };
        if !tag.is_complete() {
            out.push_str(tag.opening.text);
        }
    }
    out
}
