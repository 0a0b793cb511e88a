use serde::{Deserialize, Serialize};

/// A name a subscriber claims control over.
///
/// Only DNS identifiers exist today. Value equality is case-insensitive;
/// use [`Identifier::matches`] rather than `==` when comparing claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: &str) -> Self {
        Self {
            _type: "dns".to_owned(),
            value: value.to_owned(),
        }
    }

    pub fn is_type_dns(&self) -> bool {
        self._type == "dns"
    }

    /// Case-insensitive comparison of type and value.
    pub fn matches(&self, other: &Identifier) -> bool {
        self._type == other._type && self.value.eq_ignore_ascii_case(&other.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_match() {
        let a = Identifier::dns("Not-Example.COM");
        let b = Identifier::dns("not-example.com");
        assert!(a.matches(&b));
        assert_ne!(a, b);
    }
}
