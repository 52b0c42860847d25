//! Error vocabulary for the XMPP protocol layer.
//!
//! Covers JID and fragment parsing failures plus the fixed RFC 6120 sets of
//! stream and stanza error conditions.

use crate::element::Element;
use crate::{NS_STANZA_ERRORS, NS_STREAM_ERRORS};
use thiserror::Error;

/// Convenience alias for parse results.
pub type Result<T, E = ParseError> = std::result::Result<T, E>;

/// Errors raised while parsing JIDs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JidError {
    /// The domain part was empty or missing.
    #[error("jid has an empty domain")]
    EmptyDomain,

    /// A node (local) part was present but empty (`@domain`).
    #[error("jid has an empty node part")]
    EmptyNode,

    /// A resource part was present but empty (`user@domain/`).
    #[error("jid has an empty resource part")]
    EmptyResource,

    /// A part exceeded the 1023-byte limit.
    #[error("jid part too long: {0} bytes")]
    PartTooLong(usize),

    /// A part contained a character forbidden in that position.
    #[error("forbidden character {0:?} in jid")]
    ForbiddenCharacter(char),
}

/// Errors raised by the incremental stream parser.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// Malformed XML: unbalanced tags, bad attribute syntax, stray text.
    #[error("invalid xml: {0}")]
    InvalidXml(String),

    /// The stream was not valid UTF-8.
    #[error("invalid utf-8 at byte {0}")]
    InvalidUtf8(usize),

    /// A construct XMPP forbids on the wire (comments, processing
    /// instructions after the prolog, CDATA, DTDs).
    #[error("restricted xml construct: {0}")]
    RestrictedXml(&'static str),

    /// Element nesting exceeded the parser's depth bound.
    #[error("element nesting too deep: {0}")]
    TooDeep(usize),

    /// An undeclared entity reference.
    #[error("unknown entity reference: &{0};")]
    UnknownEntity(String),

    /// The element is not an `iq`, `message` or `presence`.
    #[error("not a stanza: <{0}/>")]
    NotAStanza(String),

    /// A stanza address attribute did not parse as a JID.
    #[error("bad stanza address {attr}={value:?}: {source}")]
    BadAddress {
        /// The offending attribute (`from` or `to`).
        attr: &'static str,
        /// The raw attribute value.
        value: String,
        /// The underlying JID error.
        source: JidError,
    },
}

/// The fixed RFC 6120 stream error conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum StreamErrorKind {
    /// The entity sent XML that cannot be processed.
    InvalidXml,
    /// A namespace was incorrect for the stream or a child.
    InvalidNamespace,
    /// The `to` of the stream header names an unhosted domain.
    HostUnknown,
    /// A resource or session conflict (second bind of the same resource).
    Conflict,
    /// The stanza `from` does not match the authorized stream identity.
    InvalidFrom,
    /// The entity violated a local service policy.
    PolicyViolation,
    /// A remote connection required to fulfil the stream failed.
    RemoteConnectionFailed,
    /// The stream was idle past the negotiated keep-alive window.
    ConnectionTimeout,
    /// A first-level child the server does not understand.
    UnsupportedStanzaType,
    /// The stream version is not supported.
    UnsupportedVersion,
    /// The entity attempted an action it is not authorized for.
    NotAuthorized,
    /// The server lacks resources to service the stream.
    ResourceConstraint,
    /// The server is shutting down.
    SystemShutdown,
    /// A condition not covered by the other members.
    UndefinedCondition,
    /// The server hit an internal misconfiguration or bug.
    InternalServerError,
}

impl StreamErrorKind {
    /// The defined-condition element name (kebab-case, as on the wire).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidXml => "invalid-xml",
            Self::InvalidNamespace => "invalid-namespace",
            Self::HostUnknown => "host-unknown",
            Self::Conflict => "conflict",
            Self::InvalidFrom => "invalid-from",
            Self::PolicyViolation => "policy-violation",
            Self::RemoteConnectionFailed => "remote-connection-failed",
            Self::ConnectionTimeout => "connection-timeout",
            Self::UnsupportedStanzaType => "unsupported-stanza-type",
            Self::UnsupportedVersion => "unsupported-version",
            Self::NotAuthorized => "not-authorized",
            Self::ResourceConstraint => "resource-constraint",
            Self::SystemShutdown => "system-shutdown",
            Self::UndefinedCondition => "undefined-condition",
            Self::InternalServerError => "internal-server-error",
        }
    }
}

impl std::fmt::Display for StreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stream-fatal error: condition plus optional descriptive text and an
/// application-specific element, per RFC 6120 §4.9.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StreamError {
    /// The defined condition.
    pub kind: StreamErrorKind,
    /// Optional human-readable text.
    pub text: Option<String>,
    /// Language of `text`.
    pub lang: Option<String>,
    /// Optional application-specific condition element.
    pub app_element: Option<Element>,
}

impl StreamError {
    /// A bare stream error with no text.
    pub fn new(kind: StreamErrorKind) -> Self {
        Self {
            kind,
            text: None,
            lang: None,
            app_element: None,
        }
    }

    /// Attach descriptive text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Render as a `<stream:error/>` element ready for the wire.
    pub fn to_element(&self) -> Element {
        let mut b = Element::builder("stream:error").child(
            Element::builder(self.kind.as_str())
                .attr("xmlns", NS_STREAM_ERRORS)
                .build(),
        );
        if let Some(text) = &self.text {
            let mut t = Element::builder("text").attr("xmlns", NS_STREAM_ERRORS);
            if let Some(lang) = &self.lang {
                t = t.attr("xml:lang", lang);
            }
            b = b.child(t.text(text).build());
        }
        if let Some(app) = &self.app_element {
            b = b.child(app.clone());
        }
        b.build()
    }
}

impl From<StreamErrorKind> for StreamError {
    fn from(kind: StreamErrorKind) -> Self {
        Self::new(kind)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.text {
            Some(t) => write!(f, "{} ({})", self.kind, t),
            None => self.kind.fmt(f),
        }
    }
}

/// Stanza error types (the `type` attribute of `<error/>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorType {
    /// Retry after changing the data.
    Modify,
    /// Retry after providing credentials.
    Auth,
    /// Retry after waiting.
    Wait,
    /// Do not retry; the error cannot be remedied.
    Cancel,
}

impl StanzaErrorType {
    /// Wire form of the type attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Modify => "modify",
            Self::Auth => "auth",
            Self::Wait => "wait",
            Self::Cancel => "cancel",
        }
    }
}

/// Stanza error defined conditions (RFC 6120 §8.3.3, the subset a routing
/// core emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaErrorCondition {
    /// Malformed or unprocessable stanza.
    BadRequest,
    /// The addressed entity already exists or the action collides.
    Conflict,
    /// The feature is not implemented by this service.
    FeatureNotImplemented,
    /// The requester is not permitted.
    Forbidden,
    /// The addressed item does not exist.
    ItemNotFound,
    /// The server hit an internal error while routing.
    InternalServerError,
    /// The intended recipient is temporarily unavailable.
    RecipientUnavailable,
    /// The remote server does not exist or cannot be resolved.
    RemoteServerNotFound,
    /// The remote server did not answer in time.
    RemoteServerTimeout,
    /// The service is unable to service the request right now.
    ResourceConstraint,
    /// The service is not provided for this recipient (also the blocked
    /// and unroutable default).
    ServiceUnavailable,
}

impl StanzaErrorCondition {
    /// The defined-condition element name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad-request",
            Self::Conflict => "conflict",
            Self::FeatureNotImplemented => "feature-not-implemented",
            Self::Forbidden => "forbidden",
            Self::ItemNotFound => "item-not-found",
            Self::InternalServerError => "internal-server-error",
            Self::RecipientUnavailable => "recipient-unavailable",
            Self::RemoteServerNotFound => "remote-server-not-found",
            Self::RemoteServerTimeout => "remote-server-timeout",
            Self::ResourceConstraint => "resource-constraint",
            Self::ServiceUnavailable => "service-unavailable",
        }
    }

    /// The default error type for this condition.
    pub fn default_type(&self) -> StanzaErrorType {
        match self {
            Self::BadRequest => StanzaErrorType::Modify,
            Self::Conflict => StanzaErrorType::Cancel,
            Self::FeatureNotImplemented => StanzaErrorType::Cancel,
            Self::Forbidden => StanzaErrorType::Auth,
            Self::ItemNotFound => StanzaErrorType::Cancel,
            Self::InternalServerError => StanzaErrorType::Cancel,
            Self::RecipientUnavailable => StanzaErrorType::Wait,
            Self::RemoteServerNotFound => StanzaErrorType::Cancel,
            Self::RemoteServerTimeout => StanzaErrorType::Wait,
            Self::ResourceConstraint => StanzaErrorType::Wait,
            Self::ServiceUnavailable => StanzaErrorType::Cancel,
        }
    }

    /// Render the `<error/>` child element for this condition.
    pub fn to_element(&self) -> Element {
        Element::builder("error")
            .attr("type", self.default_type().as_str())
            .child(
                Element::builder(self.as_str())
                    .attr("xmlns", NS_STANZA_ERRORS)
                    .build(),
            )
            .build()
    }
}

impl std::fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_kind_wire_names() {
        assert_eq!(StreamErrorKind::ConnectionTimeout.as_str(), "connection-timeout");
        assert_eq!(StreamErrorKind::SystemShutdown.as_str(), "system-shutdown");
        assert_eq!(StreamErrorKind::InternalServerError.as_str(), "internal-server-error");
    }

    #[test]
    fn stream_error_renders_condition_and_text() {
        let el = StreamError::new(StreamErrorKind::Conflict)
            .with_text("replaced by new connection")
            .to_element();
        assert_eq!(el.name(), "stream:error");
        assert!(el.child("conflict").is_some());
        let text = el.child("text").expect("text child");
        assert_eq!(text.text(), "replaced by new connection");
    }

    #[test]
    fn stanza_condition_default_types() {
        assert_eq!(
            StanzaErrorCondition::ServiceUnavailable.default_type(),
            StanzaErrorType::Cancel
        );
        assert_eq!(
            StanzaErrorCondition::ResourceConstraint.default_type(),
            StanzaErrorType::Wait
        );
    }
}
