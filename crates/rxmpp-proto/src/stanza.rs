//! Typed stanzas over [`Element`] trees.
//!
//! A [`Stanza`] is one of `iq`, `message` or `presence` with its address
//! attributes parsed up front, so routing code never re-parses JIDs on the
//! hot path. Stanzas are immutable: address rewrites produce new values.

use crate::element::Element;
use crate::error::{ParseError, StanzaErrorCondition};
use crate::jid::Jid;
use std::fmt;

/// The three stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StanzaKind {
    /// `<iq/>` request/response.
    Iq,
    /// `<message/>`.
    Message,
    /// `<presence/>`.
    Presence,
}

impl StanzaKind {
    /// The element name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Iq => "iq",
            Self::Message => "message",
            Self::Presence => "presence",
        }
    }
}

impl fmt::Display for StanzaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An addressed stanza with pre-parsed `from`/`to` JIDs.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    kind: StanzaKind,
    from: Option<Jid>,
    to: Option<Jid>,
    element: Element,
}

impl Stanza {
    /// Validate and wrap a parsed element.
    pub fn from_element(element: Element) -> Result<Self, ParseError> {
        let kind = match element.name() {
            "iq" => StanzaKind::Iq,
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            other => return Err(ParseError::NotAStanza(other.to_owned())),
        };
        let from = parse_address(&element, "from")?;
        let to = parse_address(&element, "to")?;
        Ok(Self {
            kind,
            from,
            to,
            element,
        })
    }

    /// The stanza kind.
    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    /// True for `<iq/>`.
    pub fn is_iq(&self) -> bool {
        self.kind == StanzaKind::Iq
    }

    /// True for `<message/>`.
    pub fn is_message(&self) -> bool {
        self.kind == StanzaKind::Message
    }

    /// True for `<presence/>`.
    pub fn is_presence(&self) -> bool {
        self.kind == StanzaKind::Presence
    }

    /// The `id` attribute.
    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    /// The `type` attribute.
    pub fn stanza_type(&self) -> Option<&str> {
        self.element.attr("type")
    }

    /// The `xml:lang` attribute.
    pub fn lang(&self) -> Option<&str> {
        self.element.attr("xml:lang")
    }

    /// The parsed sender address.
    pub fn from_jid(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    /// The parsed destination address.
    pub fn to_jid(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    /// The underlying element.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// Unwrap into the element.
    pub fn into_element(self) -> Element {
        self.element
    }

    /// A copy addressed to `to`.
    pub fn with_to(&self, to: &Jid) -> Stanza {
        Stanza {
            kind: self.kind,
            from: self.from.clone(),
            to: Some(to.clone()),
            element: self.element.with_attr("to", &to.to_string()),
        }
    }

    /// A copy sent from `from`.
    pub fn with_from(&self, from: &Jid) -> Stanza {
        Stanza {
            kind: self.kind,
            from: Some(from.clone()),
            to: self.to.clone(),
            element: self.element.with_attr("from", &from.to_string()),
        }
    }

    /// True for an iq of type `get` or `set`.
    pub fn is_iq_request(&self) -> bool {
        self.is_iq() && matches!(self.stanza_type(), Some("get") | Some("set"))
    }

    /// True for a message a user would read: type `chat`, `normal` or
    /// absent (which RFC 6121 treats as `normal`).
    pub fn is_routable_message(&self) -> bool {
        self.is_message()
            && matches!(self.stanza_type(), None | Some("chat") | Some("normal"))
    }

    /// True for available presence: no type attribute (or empty).
    pub fn is_available_presence(&self) -> bool {
        self.is_presence() && self.stanza_type().unwrap_or("").is_empty()
    }

    /// True for `<presence type="unavailable"/>`.
    pub fn is_unavailable_presence(&self) -> bool {
        self.is_presence() && self.stanza_type() == Some("unavailable")
    }

    /// True for presence subscription management (`subscribe{,d}`,
    /// `unsubscribe{,d}`), which is routed even to unknown resources.
    pub fn is_subscription_presence(&self) -> bool {
        self.is_presence()
            && matches!(
                self.stanza_type(),
                Some("subscribe") | Some("subscribed") | Some("unsubscribe") | Some("unsubscribed")
            )
    }

    /// The `<priority/>` of an available presence; absent means 0.
    pub fn presence_priority(&self) -> i8 {
        self.element
            .child("priority")
            .and_then(|p| p.text().trim().parse::<i8>().ok())
            .unwrap_or(0)
    }

    /// True if this stanza already carries `type="error"`.
    pub fn is_error(&self) -> bool {
        self.stanza_type() == Some("error")
    }

    /// Build the error stanza bouncing this one back to its sender:
    /// addresses swapped, `type="error"`, the original payload retained
    /// and the `<error/>` condition appended (RFC 6120 §8.3.1).
    ///
    /// Returns `None` when this stanza is itself an error (never answer an
    /// error with an error) or has no sender to bounce to.
    pub fn error_reply(&self, condition: StanzaErrorCondition) -> Option<Stanza> {
        if self.is_error() {
            return None;
        }
        let sender = self.from.clone()?;
        let mut element = self
            .element
            .with_attr("type", "error")
            .with_attr("to", &sender.to_string());
        element = match &self.to {
            Some(to) => element.with_attr("from", &to.to_string()),
            None => element.without_attr("from"),
        };
        element = element.with_child(condition.to_element());
        Some(Stanza {
            kind: self.kind,
            from: self.to.clone(),
            to: Some(sender),
            element,
        })
    }
}

fn parse_address(element: &Element, attr: &'static str) -> Result<Option<Jid>, ParseError> {
    match element.attr(attr) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<Jid>()
            .map(Some)
            .map_err(|source| ParseError::BadAddress {
                attr,
                value: raw.to_owned(),
                source,
            }),
    }
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.element.fmt(f)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = ParseError;

    fn try_from(element: Element) -> Result<Self, Self::Error> {
        Stanza::from_element(element)
    }
}

impl From<Stanza> for Element {
    fn from(stanza: Stanza) -> Element {
        stanza.element
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Stanza {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.element.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Stanza {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let element = Element::deserialize(deserializer)?;
        Stanza::from_element(element).map_err(serde::de::Error::custom)
    }
}
