#![doc = include_str!("../README.md")]

mod chunk;
mod conditional;
mod config;
mod context;
mod document;
mod error;
mod escape;
mod expression;
mod filters;
mod include;
mod surrogate;
mod tag_scanner;
mod variables;

use fastly::http::request::PendingRequest;
use fastly::{Request, Response};
use log::{debug, error, warn};
use std::collections::VecDeque;
use std::io::{Read, Write};

pub use crate::chunk::{ChunkReassembler, Utf8ChunkDecoder};
pub use crate::conditional::process_conditionals;
pub use crate::config::{Configuration, SurrogateDelegation};
pub use crate::context::EventContext;
pub use crate::document::{Element, Fragment};
pub use crate::error::{ExecutionError, Result};
pub use crate::escape::process_escapes;
pub use crate::expression::{evaluate_condition, try_evaluate_condition};
pub use crate::filters::{process_comments, process_removes};
pub use crate::include::{build_fragment_request, split_includes, Include, IncludeSegment};
pub use crate::surrogate::{
    advertise_surrogate_capability, directive_value, esi_version_supported,
    response_requests_esi, shape_processed_response,
};
pub use crate::tag_scanner::{
    attribute, find_next, Attributes, Tag, TagPattern, TagScanner, TagSpan, ESCAPE_TAG,
};
pub use crate::variables::{
    render_condition_literal, render_escaped, replace_vars, CustomVariable,
    CustomVariables, RenderStrategy, Variable, VariableLookup,
};

/// Sends a fragment request and returns its (possibly still pending) content.
pub type FragmentRequestDispatcher = dyn Fn(Request) -> Result<PendingFragmentContent>;

type CustomVariablesProvider = dyn Fn(&Request) -> CustomVariables;

/// Representation of a fragment that is either being fetched, has already been fetched (or generated synthetically), or skipped.
pub enum PendingFragmentContent {
    PendingRequest(PendingRequest),
    CompletedRequest(Response),
    /// A body produced without a backend. It is always processed as ESI.
    Synthetic(String),
    NoContent,
}

impl From<PendingRequest> for PendingFragmentContent {
    fn from(value: PendingRequest) -> Self {
        Self::PendingRequest(value)
    }
}

impl From<Response> for PendingFragmentContent {
    fn from(value: Response) -> Self {
        Self::CompletedRequest(value)
    }
}

impl From<String> for PendingFragmentContent {
    fn from(value: String) -> Self {
        Self::Synthetic(value)
    }
}

enum FragmentContent {
    Response(Response),
    Synthetic(String),
    Empty,
}

impl PendingFragmentContent {
    fn wait_for_content(self) -> Result<FragmentContent> {
        Ok(match self {
            Self::PendingRequest(pending_request) => {
                FragmentContent::Response(pending_request.wait()?)
            }
            Self::CompletedRequest(response) => FragmentContent::Response(response),
            Self::Synthetic(body) => FragmentContent::Synthetic(body),
            Self::NoContent => FragmentContent::Empty,
        })
    }
}

/// A streaming ESI processor.
///
/// The document is read in chunks of [`Configuration::chunk_size`] bytes. Plain text is
/// written through as soon as it is known not to be part of a tag, and each ESI tag is
/// rewritten as soon as it is complete. Fragment requests for `<esi:include>` are sent as
/// they are found, and their content is written in document order.
///
/// # Example
/// ```no_run
/// use fastly::Request;
/// use streaming_esi::{Configuration, Processor};
///
/// let processor = Processor::new(Configuration::default());
/// let (req, ctx) = processor.prepare_request(Request::from_client());
/// let beresp = req.send("origin_0")?;
/// processor.process_response(&ctx, beresp, None)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Processor {
    // The configuration for the processor.
    configuration: Configuration,
    // Invoked once per request, fragments included.
    custom_variables: Option<Box<CustomVariablesProvider>>,
}

impl Processor {
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            custom_variables: None,
        }
    }

    /// Registers a callback that supplies custom variables for every request processed,
    /// including fragment requests.
    #[must_use]
    pub fn with_custom_variables(
        mut self,
        provider: impl Fn(&Request) -> CustomVariables + 'static,
    ) -> Self {
        self.custom_variables = Some(Box::new(provider));
        self
    }

    pub fn configuration(&self) -> &Configuration {
        &self.configuration
    }

    /// Turns a client request into the request that is sent upstream, and captures its
    /// variables.
    ///
    /// `esi_` query arguments are removed from the upstream URL and this processor's
    /// `Surrogate-Capability` is advertised.
    pub fn prepare_request(&self, mut req: Request) -> (Request, EventContext) {
        let ctx = self.context_for(&mut req, 0);
        advertise_surrogate_capability(&mut req, &self.configuration.surrogate_capability_token);
        (req, ctx)
    }

    fn context_for(&self, req: &mut Request, level: u32) -> EventContext {
        let custom_variables = self
            .custom_variables
            .as_ref()
            .map(|provider| provider(req))
            .unwrap_or_default();
        EventContext::new(
            req,
            level,
            self.configuration.vars_cookie_blacklist.clone(),
            custom_variables,
        )
    }

    /// Whether `response` should have its body processed here.
    pub fn should_process_esi(&self, ctx: &EventContext, response: &Response) -> bool {
        if !response_requests_esi(response) {
            debug!("no ESI content in Surrogate-Control, passing through");
            return false;
        }
        let Some(content_type) = response.get_content_type() else {
            debug!("response has no content type, passing through");
            return false;
        };
        if !self.configuration.is_processable_content_type(&content_type) {
            debug!("content type `{content_type}` is not processed");
            return false;
        }
        if self
            .configuration
            .surrogate_delegation
            .permits(ctx.client_ip())
            && surrogate::downstream_supports_esi(
                ctx.request(),
                &self.configuration.surrogate_capability_token,
            )
        {
            debug!("delegating ESI processing to a downstream surrogate");
            return false;
        }
        true
    }

    /// Sends `response` to the client, processing its body on the way when it is eligible.
    ///
    /// # Errors
    /// Returns error if:
    /// * The response body cannot be read
    /// * Stream writing fails
    pub fn process_response(
        &self,
        ctx: &EventContext,
        mut response: Response,
        dispatch_fragment_request: Option<&FragmentRequestDispatcher>,
    ) -> Result<()> {
        if !self.should_process_esi(ctx, &response) {
            response.send_to_client();
            return Ok(());
        }

        shape_processed_response(&mut response);
        let body = response.take_body();

        // Send the response headers to the client and open an output stream
        let mut output_writer = response.stream_to_client();

        match self.process_document(ctx, body, &mut output_writer, dispatch_fragment_request) {
            Ok(()) => {
                output_writer.finish()?;
                Ok(())
            }
            Err(err) => {
                error!("error processing ESI document: {}", err);
                Err(err)
            }
        }
    }

    /// Processes an ESI document from `src_document`, streaming the result to `output_writer`.
    ///
    /// # Errors
    /// Returns error if reading the source or writing the output fails. Markup problems and
    /// failed fragments never produce an error.
    pub fn process_document(
        &self,
        ctx: &EventContext,
        mut src_document: impl Read,
        output_writer: &mut impl Write,
        dispatch_fragment_request: Option<&FragmentRequestDispatcher>,
    ) -> Result<()> {
        // Set up fragment request dispatcher. Use what's provided or use a default
        let dispatch_fragment_request =
            dispatch_fragment_request.unwrap_or(&default_fragment_dispatcher);

        let mut reassembler = ChunkReassembler::new();
        let mut decoder = Utf8ChunkDecoder::new();
        let mut queue: VecDeque<Element> = VecDeque::new();
        let mut buf = vec![0; self.configuration.chunk_size.max(1)];

        loop {
            let read = match src_document.read(&mut buf) {
                Ok(read) => read,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            };
            let is_final = read == 0;
            let text = decoder.decode(&buf[..read], is_final);

            reassembler.handle(&text, is_final, &mut |segment, is_esi| {
                if is_esi {
                    self.process_segment(ctx, segment, dispatch_fragment_request, &mut queue);
                } else {
                    queue.push_back(Element::Raw(segment.to_string()));
                }
                Ok(())
            })?;

            self.write_elements(ctx, &mut queue, output_writer, dispatch_fragment_request)?;
            if is_final {
                break;
            }
        }
        output_writer.flush()?;
        Ok(())
    }

    // Runs one complete ESI tag through the rewrite stages and queues the result.
    fn process_segment(
        &self,
        ctx: &EventContext,
        segment: &str,
        dispatch_fragment_request: &FragmentRequestDispatcher,
        queue: &mut VecDeque<Element>,
    ) {
        let text = process_escapes(segment);
        let text = process_comments(&text);
        let text = process_removes(&text);
        // branches are picked from the markup as written; split_includes substitutes once
        let (text, had_choose) = process_conditionals(&text, ctx);

        for piece in split_includes(&text, ctx, had_choose) {
            match piece {
                IncludeSegment::Text(text) if text.is_empty() => {}
                IncludeSegment::Text(text) => queue.push_back(Element::Raw(text)),
                IncludeSegment::Include(include) => {
                    if let Some(fragment) =
                        self.send_include(ctx, &include, dispatch_fragment_request)
                    {
                        queue.push_back(Element::Include(Box::new(fragment)));
                    }
                }
            }
        }
    }

    fn send_include(
        &self,
        ctx: &EventContext,
        include: &Include,
        dispatch_fragment_request: &FragmentRequestDispatcher,
    ) -> Option<Fragment> {
        let request = match build_fragment_request(ctx, &include.src, &self.configuration) {
            Ok(Some(request)) => request,
            Ok(None) => return None,
            Err(err) => {
                warn!("skipping include: {err}");
                return None;
            }
        };
        Some(self.send_fragment_request(ctx, request, include.alt.clone(), dispatch_fragment_request))
    }

    fn send_fragment_request(
        &self,
        ctx: &EventContext,
        mut req: Request,
        alt: Option<String>,
        dispatch_fragment_request: &FragmentRequestDispatcher,
    ) -> Fragment {
        debug!("Requesting ESI fragment: {}", req.get_url());

        let context = self.context_for(&mut req, ctx.level() + 1);
        let request = req.clone_without_body();
        let pending_content = dispatch_fragment_request(req);

        Fragment {
            request,
            alt,
            context,
            pending_content,
        }
    }

    // Writes queued elements front to back, waiting on each fragment in turn.
    fn write_elements(
        &self,
        ctx: &EventContext,
        queue: &mut VecDeque<Element>,
        output_writer: &mut impl Write,
        dispatch_fragment_request: &FragmentRequestDispatcher,
    ) -> Result<()> {
        while let Some(element) = queue.pop_front() {
            match element {
                Element::Raw(raw) => {
                    output_writer.write_all(raw.as_bytes())?;
                }
                Element::Include(fragment) => {
                    let url = fragment.request.get_url_str().to_string();
                    if let Err(err) = self.write_fragment(
                        ctx,
                        *fragment,
                        output_writer,
                        dispatch_fragment_request,
                    ) {
                        error!("failed to include fragment {url}: {err}");
                    }
                }
            }
        }
        output_writer.flush()?;
        Ok(())
    }

    fn write_fragment(
        &self,
        ctx: &EventContext,
        fragment: Fragment,
        output_writer: &mut impl Write,
        dispatch_fragment_request: &FragmentRequestDispatcher,
    ) -> Result<()> {
        // take the fragment and deconstruct it
        let Fragment {
            request,
            alt,
            context,
            pending_content,
        } = fragment;

        let content = match pending_content.and_then(PendingFragmentContent::wait_for_content) {
            Ok(content) => content,
            Err(err) => {
                warn!("fragment {} failed: {err}", request.get_url());
                return self.write_alt(ctx, alt, output_writer, dispatch_fragment_request);
            }
        };

        match content {
            FragmentContent::Empty => Ok(()),
            FragmentContent::Synthetic(body) => self.process_document(
                &context,
                body.as_bytes(),
                output_writer,
                Some(dispatch_fragment_request),
            ),
            FragmentContent::Response(mut resp) if resp.get_status().is_success() => {
                if self.should_process_esi(&context, &resp) {
                    self.process_document(
                        &context,
                        resp.take_body(),
                        output_writer,
                        Some(dispatch_fragment_request),
                    )
                } else {
                    let mut body = resp.take_body();
                    std::io::copy(&mut body, output_writer)?;
                    Ok(())
                }
            }
            FragmentContent::Response(resp) => {
                let err = ExecutionError::UnexpectedStatus(
                    request.get_url_str().to_string(),
                    resp.get_status().into(),
                );
                warn!("{err}");
                self.write_alt(ctx, alt, output_writer, dispatch_fragment_request)
            }
        }
    }

    fn write_alt(
        &self,
        ctx: &EventContext,
        alt: Option<String>,
        output_writer: &mut impl Write,
        dispatch_fragment_request: &FragmentRequestDispatcher,
    ) -> Result<()> {
        let Some(src) = alt else {
            debug!("no alt, writing nothing");
            return Ok(());
        };
        debug!("trying alt {src}");
        let include = Include { src, alt: None };
        match self.send_include(ctx, &include, dispatch_fragment_request) {
            Some(fragment) => {
                self.write_fragment(ctx, fragment, output_writer, dispatch_fragment_request)
            }
            None => Ok(()),
        }
    }
}

/// Sends the fragment request to a backend named after its host.
///
/// # Errors
/// Returns error if the request has no host or cannot be sent.
pub fn default_fragment_dispatcher(req: Request) -> Result<PendingFragmentContent> {
    debug!("no dispatch method configured, defaulting to hostname");
    let backend = req
        .get_url()
        .host_str()
        .ok_or_else(|| ExecutionError::InvalidRequestUrl(req.get_url_str().to_string()))?
        .to_string();
    let pending_req = req.send_async(backend)?;
    Ok(PendingFragmentContent::PendingRequest(pending_req))
}
