use log::trace;

use crate::tag_scanner::{TagPattern, TagScanner};
use crate::Result;

// Suffixes that may be the start of `<esi:` or `<!--esi`, longest first.
const TAG_HINTS: [&str; 8] = ["<!--es", "<!--e", "<!--", "<!-", "<!", "<es", "<e", "<"];

// Markers that can still grow into an ESI opening tag once more bytes arrive.
const INCOMPLETE_MARKERS: [&str; 2] = ["<esi:", "<esi"];

/// Splits a chunked document into ESI and non-ESI segments.
///
/// Tags cut by a read boundary are held back until the rest of the tag arrives, so a
/// segment flagged as ESI always holds one complete tag.
#[derive(Debug, Default)]
pub struct ChunkReassembler {
    pending_hint: Option<String>,
    pending_prefix: Option<String>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and reports every segment that is now final to `emit` as
    /// `(text, is_esi)`, in document order.
    ///
    /// On the final call, anything still held back is flushed as non-ESI text.
    pub fn handle(
        &mut self,
        chunk: &str,
        is_final: bool,
        emit: &mut dyn FnMut(&str, bool) -> Result<()>,
    ) -> Result<()> {
        let mut input = String::new();
        if let Some(prefix) = self.pending_prefix.take() {
            input.push_str(&prefix);
        }
        if let Some(hint) = self.pending_hint.take() {
            input.push_str(&hint);
        }
        input.push_str(chunk);

        let mut scanner = TagScanner::new(&input);
        loop {
            match scanner.next(TagPattern::AnyEsi) {
                (Some(tag), before, _) => {
                    if !before.is_empty() {
                        emit(before, false)?;
                    }
                    match tag.whole {
                        Some(whole) => emit(whole, true)?,
                        None => {
                            trace!("holding unfinished <{}> until more input arrives", tag.tagname);
                            self.pending_prefix = Some(input[tag.opening.from..].to_string());
                            break;
                        }
                    }
                }
                (None, rest, _) => {
                    if ends_with_incomplete_marker(rest) {
                        self.pending_prefix = Some(rest.to_string());
                        break;
                    }
                    let mut text = rest;
                    if !is_final {
                        if let Some(hint) = TAG_HINTS.iter().find(|hint| rest.ends_with(**hint)) {
                            let split = rest.len() - hint.len();
                            self.pending_hint = Some(rest[split..].to_string());
                            text = &rest[..split];
                        }
                    }
                    if !text.is_empty() {
                        emit(text, false)?;
                    }
                    break;
                }
            }
        }

        if is_final {
            if let Some(prefix) = self.pending_prefix.take() {
                emit(&prefix, false)?;
            }
        }
        Ok(())
    }
}

fn ends_with_incomplete_marker(text: &str) -> bool {
    INCOMPLETE_MARKERS
        .iter()
        .any(|marker| text.ends_with(*marker))
}

/// Decodes a byte stream read in arbitrary pieces into UTF-8 text.
///
/// A multi-byte sequence cut by a read boundary is carried into the next call. Invalid
/// sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    carry: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, bytes: &[u8], is_final: bool) -> String {
        let mut buf = std::mem::take(&mut self.carry);
        buf.extend_from_slice(bytes);

        let mut out = String::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to always marks a char boundary
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match err.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None if is_final => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            break;
                        }
                        None => {
                            self.carry = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(chunks: &[&str]) -> Result<Vec<(String, bool)>> {
        let mut reassembler = ChunkReassembler::new();
        let mut segments = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            reassembler.handle(chunk, i + 1 == chunks.len(), &mut |text, is_esi| {
                segments.push((text.to_string(), is_esi));
                Ok(())
            })?;
        }
        Ok(segments)
    }

    // Adjacent segments with the same flag are one logical segment.
    fn coalesce(segments: Vec<(String, bool)>) -> Vec<(String, bool)> {
        let mut merged: Vec<(String, bool)> = Vec::new();
        for (text, is_esi) in segments {
            match merged.last_mut() {
                Some((last, last_esi)) if *last_esi == is_esi && !is_esi => last.push_str(&text),
                _ => merged.push((text, is_esi)),
            }
        }
        merged
    }

    fn seg(text: &str, is_esi: bool) -> (String, bool) {
        (text.to_string(), is_esi)
    }

    #[test]
    fn test_chunk_without_esi() -> Result<()> {
        let segments = collect(&["<div>NO ESI HERE</div>"])?;
        assert_eq!(segments, vec![seg("<div>NO ESI HERE</div>", false)]);
        Ok(())
    }

    #[test]
    fn test_unfinished_tag_emits_only_before() -> Result<()> {
        let mut reassembler = ChunkReassembler::new();
        let mut segments = Vec::new();
        reassembler.handle("BEFORE TEXT<esi:foo>dfafdsafdsa", false, &mut |text, is_esi| {
            segments.push(seg(text, is_esi));
            Ok(())
        })?;
        assert_eq!(segments, vec![seg("BEFORE TEXT", false)]);
        Ok(())
    }

    #[test]
    fn test_whole_tag_in_one_chunk() -> Result<()> {
        let segments = collect(&["BEFORE TEXT<esi:foo>dfafdsafdsa</esi:foo>AFTER TEXT"])?;
        assert_eq!(
            segments,
            vec![
                seg("BEFORE TEXT", false),
                seg("<esi:foo>dfafdsafdsa</esi:foo>", true),
                seg("AFTER TEXT", false),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_tag_completed_by_second_chunk() -> Result<()> {
        let segments = collect(&[
            "BEFORE TEXT<esi:foo>dfafdsafdsa ",
            "fdsafdsafsdaf</esi:foo>AFTER TEXT",
        ])?;
        assert_eq!(
            segments,
            vec![
                seg("BEFORE TEXT", false),
                seg("<esi:foo>dfafdsafdsa fdsafdsafsdaf</esi:foo>", true),
                seg("AFTER TEXT", false),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_hint_across_boundary() -> Result<()> {
        let segments = collect(&[
            "BEFORE TEXT<es",
            "i:foo>dfafdsafdsa fdsafdsafsdaf</esi:foo>",
            "AFTER TEXT",
        ])?;
        assert_eq!(
            segments,
            vec![
                seg("BEFORE TEXT", false),
                seg("<esi:foo>dfafdsafdsa fdsafdsafsdaf</esi:foo>", true),
                seg("AFTER TEXT", false),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_incomplete_tag_is_flushed_at_end() -> Result<()> {
        let segments = collect(&["BEFORE TEXT<es", "i:foo>dfafdsafdsa"])?;
        assert_eq!(
            segments,
            vec![seg("BEFORE TEXT", false), seg("<esi:foo>dfafdsafdsa", false)]
        );

        let segments = collect(&["<esi:foo>partial"])?;
        assert_eq!(segments, vec![seg("<esi:foo>partial", false)]);
        Ok(())
    }

    #[test]
    fn test_trailing_hint_is_not_lost_at_end() -> Result<()> {
        let segments = collect(&["---", "a=1<es"])?;
        let text: String = segments.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(text, "---a=1<es");
        assert!(segments.iter().all(|(_, is_esi)| !is_esi));
        Ok(())
    }

    #[test]
    fn test_split_at_every_offset() -> Result<()> {
        let doc = "BEFORE<esi:foo>X</esi:foo>AFTER";
        let expected = vec![
            seg("BEFORE", false),
            seg("<esi:foo>X</esi:foo>", true),
            seg("AFTER", false),
        ];
        assert_eq!(collect(&[doc])?, expected);
        for split in 0..=doc.len() {
            let (a, b) = doc.split_at(split);
            let segments = coalesce(collect(&[a, b])?);
            assert_eq!(segments, expected, "split at {split}");
        }
        Ok(())
    }

    #[test]
    fn test_escape_split_at_every_offset() -> Result<()> {
        let doc = "a<!--esi <b>x</b> -->c";
        for split in 0..=doc.len() {
            let (a, b) = doc.split_at(split);
            let segments = coalesce(collect(&[a, b])?);
            assert_eq!(
                segments,
                vec![seg("a", false), seg("<!--esi <b>x</b> -->", true), seg("c", false)],
                "split at {split}"
            );
        }
        Ok(())
    }

    #[test]
    fn test_plain_text_concatenation() -> Result<()> {
        let doc = "<p>plain <em>text</em> with < and <e and <!- bits</p>";
        for size in 1..8 {
            let chunks: Vec<&str> = doc
                .as_bytes()
                .chunks(size)
                .map(|c| std::str::from_utf8(c).unwrap())
                .collect();
            let segments = collect(&chunks)?;
            let text: String = segments.iter().map(|(t, _)| t.as_str()).collect();
            assert_eq!(text, doc, "chunk size {size}");
            assert!(segments.iter().all(|(_, is_esi)| !is_esi));
        }
        Ok(())
    }

    #[test]
    fn test_non_tag_esi_prefix_is_not_deferred() -> Result<()> {
        let mut reassembler = ChunkReassembler::new();
        let mut segments = Vec::new();
        reassembler.handle("a <esix b", false, &mut |text, is_esi| {
            segments.push(seg(text, is_esi));
            Ok(())
        })?;
        assert_eq!(segments, vec![seg("a <esix b", false)]);
        Ok(())
    }

    #[test]
    fn test_utf8_decoder_carries_split_sequence() {
        let bytes = "añb€".as_bytes();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut out = String::new();
        for byte in bytes {
            out.push_str(&decoder.decode(std::slice::from_ref(byte), false));
        }
        out.push_str(&decoder.decode(&[], true));
        assert_eq!(out, "añb€");
    }

    #[test]
    fn test_utf8_decoder_replaces_invalid_bytes() {
        let mut decoder = Utf8ChunkDecoder::new();
        assert_eq!(decoder.decode(b"a\xffb", false), "a\u{FFFD}b");
        assert_eq!(decoder.decode(b"c\xe2\x82", false), "c");
        assert_eq!(decoder.decode(b"", true), "\u{FFFD}");
    }
}
