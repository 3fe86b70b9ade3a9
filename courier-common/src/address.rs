//! Normalised mailbox address
//!
//! Sender identities and recipients are compared case-insensitively everywhere
//! (ledger keys, progress file de-duplication, delivery records), so the
//! address is trimmed and lower-cased once, at the edge, and carried around as
//! this newtype afterwards.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// A trimmed, lower-cased `local@domain` address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(Arc<str>);

impl Address {
    /// Normalise and validate an address.
    ///
    /// Returns `None` unless there is exactly one `@` with something on
    /// either side of it.
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_common::Address;
    ///
    /// let address = Address::parse("  Jane.Doe@Example.COM ").unwrap();
    /// assert_eq!(address.as_str(), "jane.doe@example.com");
    /// assert!(Address::parse("not-an-address").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let normalised = raw.trim().to_lowercase();
        let (local, domain) = normalised.split_once('@')?;

        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return None;
        }

        if normalised.chars().any(char::is_whitespace) {
            return None;
        }

        Some(Self(normalised.into()))
    }

    /// Get the address as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The part after the `@`
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.split_once('@').map_or("", |(_, domain)| domain)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Deref for Address {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Address {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid address: {value}"))
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0.to_string()
    }
}
