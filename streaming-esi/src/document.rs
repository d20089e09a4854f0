use crate::context::EventContext;
use crate::{PendingFragmentContent, Result};
use fastly::Request;

/// Represents a fragment of a document that can be fetched and processed.
///
/// A `Fragment` contains the necessary information to make a request for a part of a document,
/// handle potential errors, and retrieve the content asynchronously.
///
/// # Fields
///
/// * `request` - Metadata of the request.
/// * `alt` - An optional alternate source to include if the original request fails.
/// * `context` - Variables of the fragment request, used if its response is processed.
/// * `pending_content` - The pending fragment response, or the error from dispatching it.
pub struct Fragment {
    // Metadata of the request
    pub(crate) request: Request,
    // Substituted `alt` attribute
    pub(crate) alt: Option<String>,
    // Context one recursion level below the including document
    pub(crate) context: EventContext,
    // The pending fragment response, which can be polled to retrieve the content
    pub(crate) pending_content: Result<PendingFragmentContent>,
}

/// A section of the pending response, either processed text or a pending fragment request.
/// * `Raw` - Text ready to be written.
/// * `Include` - A pending fragment request.
///
/// Elements are queued in document order and written out front to back, so a slow
/// fragment holds back everything queued after it.
pub enum Element {
    Raw(String),
    Include(Box<Fragment>),
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(raw) => write!(f, "Raw({} bytes)", raw.len()),
            Self::Include(fragment) if fragment.alt.is_some() => {
                write!(f, "Include Fragment({}, with alt)", fragment.request.get_url())
            }
            Self::Include(fragment) => write!(f, "Include Fragment({})", fragment.request.get_url()),
        }
    }
}
