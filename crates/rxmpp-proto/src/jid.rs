//! Jabber identifiers.
//!
//! A JID is `[node@]domain[/resource]`. The domain is always present; the
//! resource only appears on a *full* JID, which a server mints at resource
//! bind time. Comparisons are explicit (`matches_bare`, `matches_full`,
//! `matches_domain`) because "equality" depends on which parts a caller
//! cares about.

use crate::error::JidError;
use std::fmt;
use std::str::FromStr;

/// Per RFC 7622, every part is capped at 1023 bytes.
const MAX_PART_LEN: usize = 1023;

/// A parsed Jabber identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

impl Jid {
    /// Build a JID from parts, validating each.
    pub fn new(
        node: Option<&str>,
        domain: &str,
        resource: Option<&str>,
    ) -> Result<Self, JidError> {
        if domain.is_empty() {
            return Err(JidError::EmptyDomain);
        }
        check_part(domain, false)?;
        if let Some(n) = node {
            if n.is_empty() {
                return Err(JidError::EmptyNode);
            }
            check_part(n, true)?;
        }
        if let Some(r) = resource {
            if r.is_empty() {
                return Err(JidError::EmptyResource);
            }
            check_part(r, false)?;
        }
        Ok(Self {
            node: node.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }

    /// A domain-only JID.
    pub fn domain_only(domain: &str) -> Result<Self, JidError> {
        Self::new(None, domain, None)
    }

    /// A bare JID `node@domain`.
    pub fn bare(node: &str, domain: &str) -> Result<Self, JidError> {
        Self::new(Some(node), domain, None)
    }

    /// A full JID `node@domain/resource`.
    pub fn full(node: &str, domain: &str, resource: &str) -> Result<Self, JidError> {
        Self::new(Some(node), domain, Some(resource))
    }

    /// The node (local) part, if any.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// True when a resource is present.
    pub fn is_full(&self) -> bool {
        self.resource.is_some()
    }

    /// True when no resource is present.
    pub fn is_bare(&self) -> bool {
        self.resource.is_none()
    }

    /// True for a JID with neither node nor resource.
    pub fn is_domain_only(&self) -> bool {
        self.node.is_none() && self.resource.is_none()
    }

    /// The bare form of this JID (resource stripped).
    pub fn to_bare(&self) -> Jid {
        Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// A copy of this JID with `resource` attached (bind result).
    pub fn with_resource(&self, resource: &str) -> Result<Jid, JidError> {
        if resource.is_empty() {
            return Err(JidError::EmptyResource);
        }
        check_part(resource, false)?;
        Ok(Jid {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: Some(resource.to_owned()),
        })
    }

    /// Node and domain are equal; resources are ignored.
    pub fn matches_bare(&self, other: &Jid) -> bool {
        self.node == other.node && self.domain == other.domain
    }

    /// All three parts are equal.
    pub fn matches_full(&self, other: &Jid) -> bool {
        self.matches_bare(other) && self.resource == other.resource
    }

    /// Only the domains are equal.
    pub fn matches_domain(&self, other: &Jid) -> bool {
        self.domain == other.domain
    }
}

fn check_part(part: &str, is_node: bool) -> Result<(), JidError> {
    if part.len() > MAX_PART_LEN {
        return Err(JidError::PartTooLong(part.len()));
    }
    for c in part.chars() {
        // Control characters are forbidden in every part; the node part
        // additionally excludes the RFC 7622 separator set.
        if c.is_control() {
            return Err(JidError::ForbiddenCharacter(c));
        }
        if is_node && matches!(c, '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@') {
            return Err(JidError::ForbiddenCharacter(c));
        }
    }
    Ok(())
}

impl FromStr for Jid {
    type Err = JidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The resource separator is the first '/', the node separator the
        // first '@' before it. Resources may themselves contain '/' and '@'.
        let (before, resource) = match s.find('/') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let (node, domain) = match before.find('@') {
            Some(i) => (Some(&before[..i]), &before[i + 1..]),
            None => (None, before),
        };
        Jid::new(node, domain, resource)
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{}@", node)?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{}", resource)?;
        }
        Ok(())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Jid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Jid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_three_forms() {
        let full: Jid = "alice@ex.org/desk".parse().unwrap();
        assert_eq!(full.node(), Some("alice"));
        assert_eq!(full.domain(), "ex.org");
        assert_eq!(full.resource(), Some("desk"));
        assert!(full.is_full());

        let bare: Jid = "alice@ex.org".parse().unwrap();
        assert!(bare.is_bare());
        assert!(!bare.is_domain_only());

        let domain: Jid = "ex.org".parse().unwrap();
        assert!(domain.is_domain_only());
    }

    #[test]
    fn resource_may_contain_separators() {
        let jid: Jid = "alice@ex.org/work/laptop@home".parse().unwrap();
        assert_eq!(jid.resource(), Some("work/laptop@home"));
    }

    #[test]
    fn rejects_degenerate_forms() {
        assert_eq!("".parse::<Jid>(), Err(JidError::EmptyDomain));
        assert_eq!("@ex.org".parse::<Jid>(), Err(JidError::EmptyNode));
        assert_eq!("a@ex.org/".parse::<Jid>(), Err(JidError::EmptyResource));
        assert!(matches!(
            "a b@ex.org".parse::<Jid>(),
            Ok(_) // spaces are printable; only separators and controls are rejected
        ));
        assert!(matches!(
            "a<b@ex.org".parse::<Jid>(),
            Err(JidError::ForbiddenCharacter('<'))
        ));
    }

    #[test]
    fn comparisons_are_explicit() {
        let a: Jid = "alice@ex.org/one".parse().unwrap();
        let b: Jid = "alice@ex.org/two".parse().unwrap();
        assert!(a.matches_bare(&b));
        assert!(!a.matches_full(&b));
        assert!(a.matches_domain(&"ex.org".parse().unwrap()));
        assert_ne!(a, b);
    }

    #[test]
    fn display_round_trips() {
        for s in ["alice@ex.org/desk", "alice@ex.org", "ex.org"] {
            assert_eq!(s.parse::<Jid>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn bare_strips_resource() {
        let full: Jid = "alice@ex.org/desk".parse().unwrap();
        assert_eq!(full.to_bare(), "alice@ex.org".parse().unwrap());
        assert_eq!(full.to_bare().with_resource("desk").unwrap(), full);
    }
}
