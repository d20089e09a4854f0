use log::trace;

use crate::expression::evaluate_condition;
use crate::tag_scanner::{attribute, TagPattern, TagScanner};
use crate::variables::VariableLookup;

const CHOOSE_TAG: &str = "esi:choose";
const WHEN_TAG: &str = "esi:when";
const OTHERWISE_TAG: &str = "esi:otherwise";

/// Replaces every `<esi:choose>` block in `text` with the contents of its selected branch.
///
/// The first `<esi:when>` whose `test` holds wins. Otherwise the first `<esi:otherwise>` is
/// used, and a block with neither renders as nothing. Nested blocks inside the selected
/// branch are resolved before it is returned. The flag reports whether any block was found.
pub fn process_conditionals(text: &str, lookup: &dyn VariableLookup) -> (String, bool) {
    if !text.contains("<esi:choose") {
        return (text.to_string(), false);
    }

    let mut out = String::with_capacity(text.len());
    let mut had_choose = false;
    let mut scanner = TagScanner::new(text);
    loop {
        let (tag, before, _) = scanner.next(TagPattern::Named(&[CHOOSE_TAG]));
        out.push_str(before);
        let Some(tag) = tag else { break };
        match (tag.contents, tag.whole) {
            (Some(contents), _) => {
                had_choose = true;
                out.push_str(&select_branch(contents, lookup));
            }
            (None, Some(_)) => had_choose = true,
            // never closed, so it stays as written
            (None, None) => out.push_str(tag.opening.text),
        }
    }
    (out, had_choose)
}

fn select_branch(contents: &str, lookup: &dyn VariableLookup) -> String {
    let mut otherwise = None;
    let mut scanner = TagScanner::new(contents);
    loop {
        let (tag, _, _) = scanner.next(TagPattern::Named(&[WHEN_TAG, OTHERWISE_TAG]));
        let Some(tag) = tag else { break };
        if !tag.is_complete() {
            continue;
        }
        let body = tag.contents.unwrap_or_default();
        if tag.tagname == WHEN_TAG {
            let test = attribute(tag.opening.text, "test").unwrap_or_default();
            if evaluate_condition(test, lookup) {
                trace!("selected <esi:when test=\"{test}\">");
                return process_conditionals(body, lookup).0;
            }
        } else if otherwise.is_none() {
            otherwise = Some(body);
        }
    }
    otherwise
        .map(|body| process_conditionals(body, lookup).0)
        .unwrap_or_default()
}
