use crate::tag_scanner::{TagPattern, TagScanner, ESCAPE_TAG};

/// Unwraps `<!--esi ... -->` blocks, including blocks nested inside one another.
///
/// An escape block that is never closed is left as written.
pub fn process_escapes(text: &str) -> String {
    if !text.contains("<!--esi") {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut scanner = TagScanner::new(text);
    loop {
        let (tag, before, _) = scanner.next(TagPattern::Named(&[ESCAPE_TAG]));
        out.push_str(before);
        let Some(tag) = tag else { break };
        match tag.contents {
            Some(contents) => out.push_str(&process_escapes(contents)),
            None => out.push_str(tag.opening.text),
        }
    }
    out
}
