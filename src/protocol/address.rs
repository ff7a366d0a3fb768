//! Receiver/sender addresses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A protocol-tagged address.
///
/// Winlink addresses (bare callsigns) carry no tag. Internet mail is tagged
/// `SMTP`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Protocol tag (empty for Winlink addresses)
    pub proto: String,
    /// Address value
    pub addr: String,
}

impl Address {
    /// Create an untagged Winlink address
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            proto: String::new(),
            addr: addr.into(),
        }
    }

    /// Parse an address string.
    ///
    /// - `proto:value` splits on the first colon
    /// - `N0CALL` stays bare
    /// - `N0CALL@winlink.org` collapses to `N0CALL`
    /// - any other `user@domain` is tagged `SMTP`
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if let Some((proto, addr)) = s.split_once(':') {
            return Self {
                proto: proto.to_string(),
                addr: addr.to_string(),
            };
        }
        match s.split_once('@') {
            None => Self::new(s),
            Some((local, domain)) if domain.eq_ignore_ascii_case("winlink.org") => Self::new(local),
            Some(_) => Self {
                proto: "SMTP".to_string(),
                addr: s.to_string(),
            },
        }
    }

    /// Whether the address is unset
    pub fn is_zero(&self) -> bool {
        self.addr.is_empty()
    }

    /// Whether `other` parses to this address
    pub fn equal_string(&self, other: &str) -> bool {
        *self == Self::parse(other)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.proto.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}:{}", self.proto, self.addr)
        }
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(Address::parse("LA5NTA"), Address::new("LA5NTA"));
        assert_eq!(Address::parse("user@winlink.org"), Address::new("user"));
        assert_eq!(Address::parse("user@WinLink.ORG"), Address::new("user"));

        let smtp = Address::parse("user@example.com");
        assert_eq!(smtp.proto, "SMTP");
        assert_eq!(smtp.addr, "user@example.com");

        let tagged = Address::parse("SMTP:foo@bar.com");
        assert_eq!(tagged.proto, "SMTP");
        assert_eq!(tagged.addr, "foo@bar.com");
    }

    #[test]
    fn test_display() {
        assert_eq!(Address::parse("LA5NTA").to_string(), "LA5NTA");
        assert_eq!(Address::parse("user@example.com").to_string(), "SMTP:user@example.com");
        assert!(Address::parse("la5nta@winlink.org").equal_string("la5nta"));
    }
}
