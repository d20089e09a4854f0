//! Balanced tag finder for ESI markup.
//!
//! The scanner is not an HTML tokenizer. It looks for a small set of tag names, reads the
//! attribute region of an opening tag with a quote-aware state machine, and then counts
//! same-name opening and closing tags until the matching close is found. Everything it
//! returns borrows from the source string.

/// Tag name reported for `<!--esi ... -->` escape blocks.
pub const ESCAPE_TAG: &str = "!--esi";

const ESCAPE_OPEN: &str = "<!--esi";
const ESCAPE_CLOSE: &str = "-->";

/// Which tag names a scan should look for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagPattern<'p> {
    /// `<!--esi` or any `<esi:name` tag.
    AnyEsi,
    /// Only the listed names, e.g. `&["esi:when", "esi:otherwise"]`. Use [`ESCAPE_TAG`] for escape blocks.
    Named(&'p [&'p str]),
}

impl TagPattern<'_> {
    fn accepts_escape(&self) -> bool {
        match self {
            Self::AnyEsi => true,
            Self::Named(names) => names.contains(&ESCAPE_TAG),
        }
    }
}

/// A `[from, to)` byte range into the source, with the text it covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagSpan<'a> {
    pub from: usize,
    pub to: usize,
    pub text: &'a str,
}

/// One located markup construct.
///
/// * self-closing: `whole` is set, `closing` and `contents` are `None`
/// * balanced: `closing`, `whole` and `contents` are all set
/// * unfinished: only `opening` is set; more input may complete it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tag<'a> {
    pub opening: TagSpan<'a>,
    pub closing: Option<TagSpan<'a>>,
    pub tagname: &'a str,
    pub whole: Option<&'a str>,
    pub contents: Option<&'a str>,
}

impl<'a> Tag<'a> {
    pub fn is_complete(&self) -> bool {
        self.whole.is_some()
    }

    pub fn is_self_closing(&self) -> bool {
        self.whole.is_some() && self.closing.is_none()
    }

    /// Offset just past the last byte that belongs to this tag.
    pub fn end(&self) -> usize {
        self.closing.map_or(self.opening.to, |closing| closing.to)
    }

    fn self_closing(source: &'a str, opening: Opening<'a>) -> Self {
        let span = opening.span(source);
        Self {
            opening: span,
            closing: None,
            tagname: opening.tagname,
            whole: Some(span.text),
            contents: None,
        }
    }

    fn unfinished(source: &'a str, opening: Opening<'a>) -> Self {
        Self {
            opening: opening.span(source),
            closing: None,
            tagname: opening.tagname,
            whole: None,
            contents: None,
        }
    }

    fn balanced(source: &'a str, opening: Opening<'a>, from: usize, to: usize) -> Self {
        Self {
            opening: opening.span(source),
            closing: Some(TagSpan {
                from,
                to,
                text: &source[from..to],
            }),
            tagname: opening.tagname,
            whole: Some(&source[opening.from..to]),
            contents: Some(&source[opening.to..from]),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Opening<'a> {
    from: usize,
    to: usize,
    tagname: &'a str,
    self_closing: bool,
    terminated: bool,
}

impl<'a> Opening<'a> {
    fn span(&self, source: &'a str) -> TagSpan<'a> {
        TagSpan {
            from: self.from,
            to: self.to,
            text: &source[self.from..self.to],
        }
    }
}

enum ScanState<'a> {
    SeekingOpen,
    TrackingDepth {
        opening: Opening<'a>,
        depth: u32,
        position: usize,
    },
}

enum Nesting {
    Open,
    Close,
}

/// Finds the next tag matching `pattern` at or after byte offset `from`.
pub fn find_next<'a>(source: &'a str, from: usize, pattern: TagPattern<'_>) -> Option<Tag<'a>> {
    let mut state = ScanState::SeekingOpen;
    loop {
        state = match state {
            ScanState::SeekingOpen => {
                let opening = find_opening(source, from, pattern)?;
                if opening.self_closing {
                    return Some(Tag::self_closing(source, opening));
                }
                if !opening.terminated {
                    return Some(Tag::unfinished(source, opening));
                }
                ScanState::TrackingDepth {
                    opening,
                    depth: 1,
                    position: opening.to,
                }
            }
            ScanState::TrackingDepth {
                opening,
                depth,
                position,
            } => {
                let Some((nesting, start, end)) = next_nesting(source, position, opening.tagname)
                else {
                    return Some(Tag::unfinished(source, opening));
                };
                match nesting {
                    Nesting::Open => ScanState::TrackingDepth {
                        opening,
                        depth: depth + 1,
                        position: end,
                    },
                    Nesting::Close if depth == 1 => {
                        return Some(Tag::balanced(source, opening, start, end));
                    }
                    Nesting::Close => ScanState::TrackingDepth {
                        opening,
                        depth: depth - 1,
                        position: end,
                    },
                }
            }
        };
    }
}

fn find_opening<'a>(source: &'a str, from: usize, pattern: TagPattern<'_>) -> Option<Opening<'a>> {
    let mut cursor = from;
    while let Some(offset) = source.get(cursor..)?.find('<') {
        let lt = cursor + offset;
        if let Some(opening) = match_opening(source, lt, pattern) {
            return Some(opening);
        }
        cursor = lt + 1;
    }
    None
}

fn match_opening<'a>(source: &'a str, lt: usize, pattern: TagPattern<'_>) -> Option<Opening<'a>> {
    let rest = &source[lt + 1..];
    if pattern.accepts_escape() && rest.starts_with(ESCAPE_TAG) {
        // one space after the marker belongs to the opening, a newline does not
        let pad = usize::from(rest.as_bytes().get(ESCAPE_TAG.len()) == Some(&b' '));
        return Some(Opening {
            from: lt,
            to: lt + ESCAPE_OPEN.len() + pad,
            tagname: &rest[..ESCAPE_TAG.len()],
            self_closing: false,
            terminated: true,
        });
    }

    let name_len = match pattern {
        TagPattern::AnyEsi => {
            let letters = rest
                .strip_prefix("esi:")?
                .bytes()
                .take_while(u8::is_ascii_lowercase)
                .count();
            if letters == 0 {
                return None;
            }
            "esi:".len() + letters
        }
        TagPattern::Named(names) => names
            .iter()
            .filter(|name| **name != ESCAPE_TAG)
            .find(|name| {
                rest.starts_with(**name) && is_name_boundary(rest.as_bytes().get(name.len()))
            })?
            .len(),
    };
    if !is_name_boundary(rest.as_bytes().get(name_len)) {
        return None;
    }

    let end = scan_tag_end(source, lt + 1 + name_len);
    Some(Opening {
        from: lt,
        to: end.to,
        tagname: &rest[..name_len],
        self_closing: end.self_closing,
        terminated: end.terminated,
    })
}

fn is_name_boundary(next: Option<&u8>) -> bool {
    match next {
        None => true,
        Some(b) => !(b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b':')),
    }
}

struct TagEnd {
    to: usize,
    self_closing: bool,
    terminated: bool,
}

// Walks the attribute region of an opening tag until the first `>` outside quotes.
fn scan_tag_end(source: &str, start: usize) -> TagEnd {
    let bytes = source.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => {
                i += 2;
                continue;
            }
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => {
                    return TagEnd {
                        to: i + 1,
                        self_closing: i > start && bytes[i - 1] == b'/',
                        terminated: true,
                    };
                }
                _ => {}
            },
        }
        i += 1;
    }
    TagEnd {
        to: bytes.len(),
        self_closing: false,
        terminated: false,
    }
}

// Next same-name opening or well-formed closing tag. Stray closers such as
// `</esi:when alt="...">` or closers of other tags are skipped as plain text.
fn next_nesting(source: &str, from: usize, tagname: &str) -> Option<(Nesting, usize, usize)> {
    if tagname == ESCAPE_TAG {
        let rest = source.get(from..)?;
        let open = rest.find(ESCAPE_OPEN);
        let close = rest.find(ESCAPE_CLOSE);
        return match (open, close) {
            (Some(o), Some(c)) if o < c => {
                Some((Nesting::Open, from + o, from + o + ESCAPE_OPEN.len()))
            }
            (_, Some(c)) => Some((Nesting::Close, from + c, from + c + ESCAPE_CLOSE.len())),
            (Some(o), None) => Some((Nesting::Open, from + o, from + o + ESCAPE_OPEN.len())),
            (None, None) => None,
        };
    }

    let mut cursor = from;
    while let Some(offset) = source.get(cursor..)?.find('<') {
        let lt = cursor + offset;
        let rest = &source[lt + 1..];
        if let Some(after_name) = rest.strip_prefix('/').and_then(|r| r.strip_prefix(tagname)) {
            let trimmed = after_name.trim_start();
            if trimmed.starts_with('>') {
                let end = source.len() - trimmed.len() + 1;
                return Some((Nesting::Close, lt, end));
            }
        } else if rest.starts_with(tagname)
            && is_name_boundary(rest.as_bytes().get(tagname.len()))
        {
            let end = scan_tag_end(source, lt + 1 + tagname.len());
            if !end.self_closing {
                return Some((Nesting::Open, lt, end.to));
            }
            cursor = end.to;
            continue;
        }
        cursor = lt + 1;
    }
    None
}

/// Stateful scan session over one source string.
///
/// Every call to [`TagScanner::next`] continues where the previous tag ended. The cursor never
/// moves backwards.
pub struct TagScanner<'a> {
    source: &'a str,
    cursor: usize,
}

impl<'a> TagScanner<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Returns the next tag together with the text before it and everything after it.
    ///
    /// When nothing matches, the remaining text is returned as `before`, `after` is empty
    /// and the scanner is exhausted.
    pub fn next(&mut self, pattern: TagPattern<'_>) -> (Option<Tag<'a>>, &'a str, &'a str) {
        let start = self.cursor;
        match find_next(self.source, start, pattern) {
            Some(tag) => {
                let end = tag.end();
                self.cursor = end;
                (
                    Some(tag),
                    &self.source[start..tag.opening.from],
                    &self.source[end..],
                )
            }
            None => {
                self.cursor = self.source.len();
                (None, &self.source[start..], "")
            }
        }
    }
}

/// Returns the raw value of attribute `name` in an opening tag. Escapes are left in place.
pub fn attribute<'a>(opening: &'a str, name: &str) -> Option<&'a str> {
    Attributes::new(opening)
        .find(|(attr, _)| attr.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

/// Iterator over `(name, value)` pairs of an opening tag.
pub struct Attributes<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Attributes<'a> {
    pub fn new(opening: &'a str) -> Self {
        let bytes = opening.as_bytes();
        let mut pos = usize::from(bytes.first() == Some(&b'<'));
        while pos < bytes.len()
            && !(bytes[pos].is_ascii_whitespace() || bytes[pos] == b'/' || bytes[pos] == b'>')
        {
            pos += 1;
        }
        Self { text: opening, pos }
    }

    fn skip_while(&mut self, pred: impl Fn(u8) -> bool) {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && pred(bytes[self.pos]) {
            self.pos += 1;
        }
    }
}

impl<'a> Iterator for Attributes<'a> {
    type Item = (&'a str, &'a str);

    fn next(&mut self) -> Option<Self::Item> {
        let text = self.text;
        let bytes = text.as_bytes();
        self.skip_while(|b| b.is_ascii_whitespace() || b == b'/');
        if self.pos >= bytes.len() || bytes[self.pos] == b'>' {
            return None;
        }

        let name_start = self.pos;
        self.skip_while(|b| !(b.is_ascii_whitespace() || matches!(b, b'=' | b'>' | b'/')));
        let name = &text[name_start..self.pos];
        self.skip_while(|b| b.is_ascii_whitespace());
        if bytes.get(self.pos) != Some(&b'=') {
            return Some((name, ""));
        }
        self.pos += 1;
        self.skip_while(|b| b.is_ascii_whitespace());

        match bytes.get(self.pos) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                self.pos += 1;
                let value_start = self.pos;
                while self.pos < bytes.len() && bytes[self.pos] != quote {
                    if bytes[self.pos] == b'\\' {
                        self.pos += 1;
                    }
                    self.pos += 1;
                }
                let value_end = self.pos.min(bytes.len());
                self.pos = (self.pos + 1).min(bytes.len());
                Some((name, &text[value_start..value_end]))
            }
            _ => {
                let value_start = self.pos;
                self.skip_while(|b| !(b.is_ascii_whitespace() || b == b'>'));
                let mut value = &text[value_start..self.pos];
                if bytes.get(self.pos) == Some(&b'>') {
                    value = value.strip_suffix('/').unwrap_or(value);
                }
                Some((name, value))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_named_tag() {
        let mut scanner = TagScanner::new("content-before<foo>inside</foo>content-after");
        let (tag, before, after) = scanner.next(TagPattern::Named(&["foo"]));
        assert_eq!(
            tag,
            Some(Tag {
                opening: TagSpan {
                    from: 14,
                    to: 19,
                    text: "<foo>"
                },
                closing: Some(TagSpan {
                    from: 25,
                    to: 31,
                    text: "</foo>"
                }),
                tagname: "foo",
                whole: Some("<foo>inside</foo>"),
                contents: Some("inside"),
            })
        );
        assert_eq!(before, "content-before");
        assert_eq!(after, "content-after");
        assert_eq!(scanner.position(), 31);
    }

    #[test]
    fn test_default_pattern_finds_esi_tags_in_order() {
        let mut scanner = TagScanner::new(
            "content-before<esi:foo>inside</esi:foo>content-after<!--esi comment-->last",
        );

        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        let tag = tag.unwrap();
        assert_eq!(tag.tagname, "esi:foo");
        assert_eq!(tag.whole, Some("<esi:foo>inside</esi:foo>"));
        assert_eq!(tag.contents, Some("inside"));
        assert_eq!(before, "content-before");
        assert_eq!(after, "content-after<!--esi comment-->last");

        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        let tag = tag.unwrap();
        assert_eq!(tag.tagname, ESCAPE_TAG);
        assert_eq!(tag.opening.text, "<!--esi ");
        assert_eq!(tag.closing.unwrap().text, "-->");
        assert_eq!(tag.whole, Some("<!--esi comment-->"));
        assert_eq!(tag.contents, Some("comment"));
        assert_eq!(before, "content-after");
        assert_eq!(after, "last");

        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        assert!(tag.is_none());
        assert_eq!(before, "last");
        assert_eq!(after, "");
    }

    #[test]
    fn test_unclosed_tag() {
        let mut scanner =
            TagScanner::new("content-before<esi:foo>inside content-after<!--esi comment-->last");
        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        let tag = tag.unwrap();
        assert_eq!(tag.opening.text, "<esi:foo>");
        assert!(tag.closing.is_none());
        assert!(tag.whole.is_none());
        assert!(tag.contents.is_none());
        assert!(!tag.is_complete());
        assert_eq!(before, "content-before");
        assert_eq!(after, "inside content-after<!--esi comment-->last");
    }

    #[test]
    fn test_self_closing_tag() {
        let mut scanner = TagScanner::new(r#"content-before<esi:comment test="12345" />content-after"#);
        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        let tag = tag.unwrap();
        assert!(tag.is_self_closing());
        assert_eq!(tag.tagname, "esi:comment");
        assert_eq!(tag.opening.from, 14);
        assert_eq!(tag.opening.to, 42);
        assert_eq!(tag.whole, Some(r#"<esi:comment test="12345" />"#));
        assert_eq!(tag.contents, None);
        assert_eq!(before, "content-before");
        assert_eq!(after, "content-after");
    }

    #[test]
    fn test_quoted_gt_in_attributes() {
        let source = r#"<esi:when test="2 > 1 && '>' == '>'">yes</esi:when>"#;
        let tag = find_next(source, 0, TagPattern::Named(&["esi:when"])).unwrap();
        assert_eq!(tag.opening.text, r#"<esi:when test="2 > 1 && '>' == '>'">"#);
        assert_eq!(tag.contents, Some("yes"));
    }

    #[test]
    fn test_escaped_quote_does_not_end_attribute() {
        let source = r#"<esi:when test="'a \">' == 'b'">x</esi:when>"#;
        let tag = find_next(source, 0, TagPattern::AnyEsi).unwrap();
        assert_eq!(tag.contents, Some("x"));
        assert_eq!(
            attribute(tag.opening.text, "test"),
            Some(r#"'a \">' == 'b'"#)
        );
    }

    #[test]
    fn test_tag_with_attributes() {
        let mut scanner =
            TagScanner::new("content-before<foo attr='value' attr2='value2'>inside</foo>content-after");
        let (tag, before, after) = scanner.next(TagPattern::Named(&["foo"]));
        let tag = tag.unwrap();
        assert_eq!(tag.opening.text, "<foo attr='value' attr2='value2'>");
        assert_eq!(tag.contents, Some("inside"));
        assert_eq!(before, "content-before");
        assert_eq!(after, "content-after");
    }

    #[test]
    fn test_nested_same_name_tags() {
        let source = "content-before<foo>inside-foo<bar>inside-bar</bar>after-bar<foo>inside-foo-2</foo></foo>content-after";
        let mut scanner = TagScanner::new(source);
        let (tag, _, after) = scanner.next(TagPattern::Named(&["foo"]));
        let tag = tag.unwrap();
        assert_eq!(
            tag.contents,
            Some("inside-foo<bar>inside-bar</bar>after-bar<foo>inside-foo-2</foo>")
        );
        assert_eq!(tag.closing.unwrap().from, 82);
        assert_eq!(after, "content-after");
    }

    #[test]
    fn test_name_boundary() {
        assert!(find_next("<foobar>x</foobar>", 0, TagPattern::Named(&["foo"])).is_none());
        assert!(find_next("<esi:include2 src='x'/>", 0, TagPattern::AnyEsi).is_none());
        assert!(find_next("<esi:>", 0, TagPattern::AnyEsi).is_none());
        let tag = find_next("<esi:vars\n>a</esi:vars >", 0, TagPattern::AnyEsi).unwrap();
        assert_eq!(tag.contents, Some("a"));
        assert_eq!(tag.closing.unwrap().text, "</esi:vars >");
    }

    #[test]
    fn test_nested_self_closing_does_not_nest() {
        let tag = find_next(
            "<esi:vars>a<esi:vars/>b</esi:vars>c",
            0,
            TagPattern::Named(&["esi:vars"]),
        )
        .unwrap();
        assert_eq!(tag.contents, Some("a<esi:vars/>b"));
    }

    #[test]
    fn test_unterminated_opening_runs_to_end() {
        let tag = find_next("text<esi:include src=\"/frag", 0, TagPattern::AnyEsi).unwrap();
        assert_eq!(tag.opening.from, 4);
        assert_eq!(tag.opening.text, "<esi:include src=\"/frag");
        assert!(!tag.is_complete());
    }

    #[test]
    fn test_nested_escapes() {
        let source = "a<!--esi one <!--esi two --> three -->b";
        let tag = find_next(source, 0, TagPattern::AnyEsi).unwrap();
        assert_eq!(tag.contents, Some("one <!--esi two --> three "));

        let tag = find_next("<!--esi\nline\n-->", 0, TagPattern::AnyEsi).unwrap();
        assert_eq!(tag.opening.text, "<!--esi");
        assert_eq!(tag.contents, Some("\nline\n"));
        assert_eq!(&source[tag.end()..], "b");
    }

    #[test]
    fn test_alternative_names_track_their_own_depth() {
        let source = "<esi:otherwise>x<esi:when test='1'>y</esi:when></esi:otherwise>";
        let tag = find_next(source, 0, TagPattern::Named(&["esi:when", "esi:otherwise"])).unwrap();
        assert_eq!(tag.tagname, "esi:otherwise");
        assert_eq!(tag.contents, Some("x<esi:when test='1'>y</esi:when>"));
    }

    #[test]
    fn test_illegal_closure_is_tolerated() {
        let source = r#"BEFORE CONTENT<esi:when test="$(QUERY_STRING{c}) == 'c'">c<esi:choose></esi:vars alt="BAD ILLEGAL NESTING"><esi:when test="$(QUERY_STRING{l1d}) == 'l1d'">l1d</esi:when><esi:when test="$(QUERY_STRING{l1e}) == 'l1e'">l1e<esi:choose><esi:when test="$(QUERY_STRING{l2f}) == 'l2f'">l2f</esi:when><esi:otherwise>l2 OTHERWISE</esi:otherwise></esi:choose></esi:when><esi:otherwise>l1 OTHERWISE<esi:choose><esi:when test="$(QUERY_STRING{l2g}) == 'l2g'">l2g</esi:when></esi:when alt="MORE BAD ILLEGAL NESTING"></esi:choose></esi:otherwise></esi:choose></esi:when>AFTER"#;
        let mut scanner = TagScanner::new(source);
        let (tag, before, after) = scanner.next(TagPattern::Named(&["esi:when", "esi:otherwise"]));
        let tag = tag.unwrap();
        assert_eq!(tag.tagname, "esi:when");
        assert_eq!(
            tag.opening.text,
            r#"<esi:when test="$(QUERY_STRING{c}) == 'c'">"#
        );
        let closing = tag.closing.unwrap();
        assert_eq!(closing.text, "</esi:when>");
        assert_eq!(closing.to, source.len() - "AFTER".len());
        assert!(tag
            .contents
            .unwrap()
            .ends_with(r#"</esi:when alt="MORE BAD ILLEGAL NESTING"></esi:choose></esi:otherwise></esi:choose>"#));
        assert_eq!(before, "BEFORE CONTENT");
        assert_eq!(after, "AFTER");
    }

    #[test]
    fn test_non_ascii_text_is_sliced_safely() {
        let source = "héllo <esi:vars>ünïcode</esi:vars> wörld";
        let mut scanner = TagScanner::new(source);
        let (tag, before, after) = scanner.next(TagPattern::AnyEsi);
        assert_eq!(tag.unwrap().contents, Some("ünïcode"));
        assert_eq!(before, "héllo ");
        assert_eq!(after, " wörld");
    }

    #[test]
    fn test_attributes() {
        let opening = r#"<esi:include src="/a?b=1" alt='/fallback' onerror=continue/>"#;
        let attrs: Vec<_> = Attributes::new(opening).collect();
        assert_eq!(
            attrs,
            vec![("src", "/a?b=1"), ("alt", "/fallback"), ("onerror", "continue")]
        );
        assert_eq!(attribute(opening, "SRC"), Some("/a?b=1"));
        assert_eq!(attribute(opening, "missing"), None);
        assert_eq!(attribute("<esi:when test=\"1 == 1\">", "test"), Some("1 == 1"));
    }
}
