//! # rxmpp-proto
//!
//! Protocol types for XMPP servers: JID addressing, immutable stanza trees,
//! incremental stream framing and the RFC 6120 error vocabulary.
//!
//! The crate deliberately stops below the transport: it parses and renders
//! XML stream *fragments* (stanzas and stream headers), and leaves sockets,
//! TLS and SASL to the daemon.
//!
//! ## Quick start
//!
//! ```rust
//! use rxmpp_proto::{Element, Jid, Stanza};
//!
//! let jid: Jid = "alice@example.org/desk".parse().unwrap();
//! assert_eq!(jid.to_bare().to_string(), "alice@example.org");
//!
//! let el = Element::builder("message")
//!     .attr("from", "alice@example.org/desk")
//!     .attr("to", "bob@example.org")
//!     .attr("type", "chat")
//!     .child(Element::builder("body").text("hi").build())
//!     .build();
//! let msg = Stanza::from_element(el).unwrap();
//! assert!(msg.is_message());
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod element;
pub mod error;
pub mod jid;
pub mod parser;
pub mod stanza;

pub use element::{Element, ElementBuilder, Node};
pub use error::{
    JidError, ParseError, StanzaErrorCondition, StanzaErrorType, StreamError, StreamErrorKind,
};
pub use jid::Jid;
pub use parser::{StreamEvent, StreamParser};
pub use stanza::{Stanza, StanzaKind};

/// The `jabber:client` content namespace.
pub const NS_CLIENT: &str = "jabber:client";
/// The `jabber:component:accept` content namespace (XEP-0114).
pub const NS_COMPONENT: &str = "jabber:component:accept";
/// The `http://etherx.jabber.org/streams` stream namespace.
pub const NS_STREAM: &str = "http://etherx.jabber.org/streams";
/// The RFC 6120 stream error namespace.
pub const NS_STREAM_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-streams";
/// The RFC 6120 stanza error namespace.
pub const NS_STANZA_ERRORS: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";
/// The STARTTLS negotiation namespace.
pub const NS_TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
/// The SASL negotiation namespace.
pub const NS_SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
/// The resource binding namespace.
pub const NS_BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
