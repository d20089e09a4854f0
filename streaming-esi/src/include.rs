use fastly::http::{header, Url};
use fastly::Request;
use log::{debug, warn};

use crate::context::EventContext;
use crate::surrogate::advertise_surrogate_capability;
use crate::tag_scanner::{attribute, TagPattern, TagScanner};
use crate::variables::{render_escaped, replace_vars, VariableLookup};
use crate::{Configuration, ExecutionError, Result};

const INCLUDE_TAG: &str = "esi:include";
const VARS_TAG: &str = "esi:vars";

pub(crate) const RECURSION_LEVEL_HEADER: &str = "X-ESI-Recursion-Level";
pub(crate) const PARENT_URI_HEADER: &str = "X-ESI-Parent-URI";

/// An `<esi:include>` with its attributes already substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    pub src: String,
    pub alt: Option<String>,
}

/// A piece of processed ESI text, in document order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncludeSegment {
    Text(String),
    Include(Include),
}

/// Splits `text` around its `<esi:include>` tags and renders its `<esi:vars>` blocks.
///
/// References in `<esi:vars>` bodies and in include `src`/`alt` attributes are always
/// substituted. With `eval_vars`, references in the surrounding text are substituted too.
/// Each reference is read from the markup as written and substituted once, so a value that
/// itself looks like `$(...)` comes out verbatim. Includes without a `src` are dropped. Tags
/// that are never closed stay as text.
pub fn split_includes(
    text: &str,
    lookup: &dyn VariableLookup,
    eval_vars: bool,
) -> Vec<IncludeSegment> {
    let mut segments = Vec::new();
    render_segments(text, lookup, eval_vars, &mut segments);
    segments
}

fn render_segments(
    text: &str,
    lookup: &dyn VariableLookup,
    eval_vars: bool,
    segments: &mut Vec<IncludeSegment>,
) {
    let render = |raw: &str| {
        if eval_vars {
            replace_vars(raw, lookup, render_escaped)
        } else {
            raw.to_string()
        }
    };
    if !text.contains("<esi:include") && !text.contains("<esi:vars") {
        push_text(segments, render(text));
        return;
    }

    let mut scanner = TagScanner::new(text);
    loop {
        let (tag, before, _) = scanner.next(TagPattern::Named(&[INCLUDE_TAG, VARS_TAG]));
        push_text(segments, render(before));
        let Some(tag) = tag else { break };
        if !tag.is_complete() {
            push_text(segments, render(tag.opening.text));
            continue;
        }
        if tag.tagname == VARS_TAG {
            // <esi:vars/> has nothing to render
            if let Some(contents) = tag.contents {
                render_segments(contents, lookup, true, segments);
            }
            continue;
        }
        match attribute(tag.opening.text, "src") {
            Some(src) if !src.is_empty() => {
                segments.push(IncludeSegment::Include(Include {
                    src: replace_vars(src, lookup, render_escaped),
                    alt: attribute(tag.opening.text, "alt")
                        .filter(|alt| !alt.is_empty())
                        .map(|alt| replace_vars(alt, lookup, render_escaped)),
                }));
            }
            _ => debug!("ignoring include without src: {}", tag.opening.text),
        }
    }
}

// Adjacent text is merged so callers see one segment per run of output.
fn push_text(segments: &mut Vec<IncludeSegment>, text: String) {
    if text.is_empty() {
        return;
    }
    match segments.last_mut() {
        Some(IncludeSegment::Text(last)) => last.push_str(&text),
        _ => segments.push(IncludeSegment::Text(text)),
    }
}

/// Builds the request for one include, or `None` when policy says it must be skipped.
///
/// # Errors
/// Returns [`ExecutionError::InvalidRequestUrl`] when `src` does not resolve to an http(s) URL.
pub fn build_fragment_request(
    ctx: &EventContext,
    src: &str,
    configuration: &Configuration,
) -> Result<Option<Request>> {
    let child_level = ctx.level() + 1;
    if child_level >= configuration.recursion_limit {
        debug!(
            "recursion limit {} reached, skipping include {src}",
            configuration.recursion_limit
        );
        return Ok(None);
    }

    let url = resolve_url(ctx.url(), src)?;
    let host = url
        .host_str()
        .ok_or_else(|| ExecutionError::InvalidRequestUrl(src.to_string()))?;
    let same_host = ctx.url().host_str() == Some(host);

    if !same_host
        && configuration.disable_third_party_includes
        && !configuration.is_whitelisted_host(host, url.port())
    {
        warn!("third party include to {host} is not allowed, skipping {url}");
        return Ok(None);
    }

    let host_header = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let parent = ctx.request();
    let mut request = Request::get(url.clone());
    request.set_header(header::HOST, host_header);

    if same_host {
        for name in [header::AUTHORIZATION, header::COOKIE] {
            if let Some(value) = parent.get_header(&name) {
                request.set_header(&name, value.clone());
            }
        }
    }
    if let Some(value) = parent.get_header(header::CACHE_CONTROL) {
        request.set_header(header::CACHE_CONTROL, value.clone());
    }
    request.set_header(RECURSION_LEVEL_HEADER, child_level.to_string());
    request.set_header(PARENT_URI_HEADER, parent.get_url_str());
    advertise_surrogate_capability(&mut request, &configuration.surrogate_capability_token);

    Ok(Some(request))
}

// Relative, absolute-path and protocol-relative forms all resolve against the parent.
fn resolve_url(base: &Url, src: &str) -> Result<Url> {
    let url = base
        .join(src)
        .map_err(|_| ExecutionError::InvalidRequestUrl(src.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        _ => Err(ExecutionError::InvalidRequestUrl(src.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::CustomVariables;

    fn context(url: &str, level: u32) -> EventContext {
        let mut req = Request::get(url)
            .with_header(header::AUTHORIZATION, "Basic abc")
            .with_header(header::COOKIE, "session=1")
            .with_header(header::CACHE_CONTROL, "no-cache");
        EventContext::new(&mut req, level, vec![], CustomVariables::new())
    }

    fn lookup(name: &str, key: Option<&str>, default: &str) -> String {
        match (name, key) {
            ("QUERY_STRING", Some("id")) => "42".to_string(),
            ("QUERY_STRING", Some("evil")) => "<esi:include src=\"/x\"/>".to_string(),
            ("QUERY_STRING", Some("ref")) => "$(HTTP_AUTHORIZATION)".to_string(),
            ("HTTP_AUTHORIZATION", _) => "Bearer secret".to_string(),
            _ => default.to_string(),
        }
    }

    #[test]
    fn test_split_includes() {
        let segments = split_includes(
            r#"a<esi:include src="/f?id=$(QUERY_STRING{id})" alt='/alt'/>b<esi:include src="/g"></esi:include>c"#,
            &lookup,
            false,
        );
        assert_eq!(
            segments,
            vec![
                IncludeSegment::Text("a".to_string()),
                IncludeSegment::Include(Include {
                    src: "/f?id=42".to_string(),
                    alt: Some("/alt".to_string()),
                }),
                IncludeSegment::Text("b".to_string()),
                IncludeSegment::Include(Include {
                    src: "/g".to_string(),
                    alt: None,
                }),
                IncludeSegment::Text("c".to_string()),
            ]
        );
    }

    #[test]
    fn test_split_includes_vars_in_text() {
        let text = "id=$(QUERY_STRING{id}) $(QUERY_STRING{evil})";
        assert_eq!(
            split_includes(text, &lookup, true),
            vec![IncludeSegment::Text(
                "id=42 &lt;esi:include src=\"/x\"/&gt;".to_string()
            )]
        );
        assert_eq!(
            split_includes(text, &lookup, false),
            vec![IncludeSegment::Text(text.to_string())]
        );
    }

    #[test]
    fn test_vars_blocks() {
        let text = "$(QUERY_STRING{id}) <esi:vars>a=$(QUERY_STRING{id})</esi:vars><esi:vars/> <esi:vars>open";
        assert_eq!(
            split_includes(text, &lookup, false),
            vec![IncludeSegment::Text(
                "$(QUERY_STRING{id}) a=42 <esi:vars>open".to_string()
            )]
        );
    }

    #[test]
    fn test_substituted_values_are_not_expanded_again() {
        for eval_vars in [false, true] {
            assert_eq!(
                split_includes("<esi:vars>$(QUERY_STRING{ref})</esi:vars>", &lookup, eval_vars),
                vec![IncludeSegment::Text("$(HTTP_AUTHORIZATION)".to_string())]
            );
        }
        assert_eq!(
            split_includes("[$(QUERY_STRING{ref})]", &lookup, true),
            vec![IncludeSegment::Text("[$(HTTP_AUTHORIZATION)]".to_string())]
        );
        assert_eq!(
            split_includes(
                r#"<esi:vars>a<esi:include src="/f?q=$(QUERY_STRING{ref})"/>$(QUERY_STRING{id})</esi:vars>"#,
                &lookup,
                true,
            ),
            vec![
                IncludeSegment::Text("a".to_string()),
                IncludeSegment::Include(Include {
                    src: "/f?q=$(HTTP_AUTHORIZATION)".to_string(),
                    alt: None,
                }),
                IncludeSegment::Text("42".to_string()),
            ]
        );
    }

    #[test]
    fn test_include_without_src_is_dropped() {
        assert_eq!(
            split_includes("a<esi:include />b", &lookup, false),
            vec![IncludeSegment::Text("ab".to_string())]
        );
    }

    #[test]
    fn test_fragment_request_headers() -> Result<()> {
        let ctx = context("http://example.com/page?x=1", 0);
        let config = Configuration::default();
        let req = build_fragment_request(&ctx, "/fragment", &config)?
            .expect("include should be allowed");
        assert_eq!(req.get_url_str(), "http://example.com/fragment");
        assert_eq!(req.get_header_str(header::HOST), Some("example.com"));
        assert_eq!(req.get_header_str(header::AUTHORIZATION), Some("Basic abc"));
        assert_eq!(req.get_header_str(header::COOKIE), Some("session=1"));
        assert_eq!(req.get_header_str(header::CACHE_CONTROL), Some("no-cache"));
        assert_eq!(req.get_header_str(RECURSION_LEVEL_HEADER), Some("1"));
        assert_eq!(
            req.get_header_str(PARENT_URI_HEADER),
            Some("http://example.com/page?x=1")
        );
        assert_eq!(
            req.get_header_str("Surrogate-Capability"),
            Some(r#"fastlyESI="ESI/1.0""#)
        );
        Ok(())
    }

    #[test]
    fn test_third_party_request_has_no_credentials() -> Result<()> {
        let ctx = context("http://example.com/page", 0);
        let config = Configuration::default();
        let req = build_fragment_request(&ctx, "//cdn.example.net:8080/f", &config)?
            .expect("third party includes are allowed by default");
        assert_eq!(req.get_url_str(), "http://cdn.example.net:8080/f");
        assert_eq!(req.get_header_str(header::HOST), Some("cdn.example.net:8080"));
        assert!(req.get_header(header::AUTHORIZATION).is_none());
        assert!(req.get_header(header::COOKIE).is_none());
        assert_eq!(req.get_header_str(header::CACHE_CONTROL), Some("no-cache"));
        Ok(())
    }

    #[test]
    fn test_third_party_policy() -> Result<()> {
        let ctx = context("http://example.com/page", 0);
        let config = Configuration::default().with_third_party_includes_disabled(true);
        assert!(build_fragment_request(&ctx, "http://other.com/f", &config)?.is_none());
        assert!(build_fragment_request(&ctx, "/f", &config)?.is_some());

        let config = config.with_third_party_includes_domain_whitelist(["other.com"]);
        assert!(build_fragment_request(&ctx, "http://other.com/f", &config)?.is_some());
        Ok(())
    }

    #[test]
    fn test_recursion_limit() -> Result<()> {
        let config = Configuration::default().with_recursion_limit(3);
        assert!(build_fragment_request(&context("http://example.com/", 1), "/f", &config)?
            .is_some());
        assert!(build_fragment_request(&context("http://example.com/", 2), "/f", &config)?
            .is_none());
        Ok(())
    }

    #[test]
    fn test_invalid_url() {
        let ctx = context("http://example.com/", 0);
        let config = Configuration::default();
        assert!(matches!(
            build_fragment_request(&ctx, "http://[::1", &config),
            Err(ExecutionError::InvalidRequestUrl(_))
        ));
        assert!(matches!(
            build_fragment_request(&ctx, "javascript:alert(1)", &config),
            Err(ExecutionError::InvalidRequestUrl(_))
        ));
    }
}
