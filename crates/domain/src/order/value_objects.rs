//! Value objects for the order domain.

use serde::{Deserialize, Serialize};

use super::OrderError;

/// Product identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Creates a new product ID from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the product ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ProductId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a customer can be reached (an email address or phone number).
///
/// Never blank when built through [`CustomerContact::parse`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerContact(String);

impl CustomerContact {
    /// Trims the input and returns `None` when nothing is left.
    pub fn parse(raw: impl AsRef<str>) -> Option<Self> {
        let trimmed = raw.as_ref().trim();
        (!trimmed.is_empty()).then(|| Self(trimmed.to_string()))
    }

    /// Returns the contact as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the contact is empty or whitespace.
    ///
    /// Only possible for contacts decoded from the wire.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for CustomerContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Contact fields as producers send them: `customerContact`, or the legacy
/// `customerEmail` and `email`. Any combination may be present.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ContactFields {
    #[serde(default)]
    customer_contact: Option<String>,
    #[serde(default)]
    customer_email: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

impl ContactFields {
    /// First non-blank of `customerContact`, `customerEmail`, `email`.
    pub(super) fn into_raw(self) -> Option<String> {
        [self.customer_contact, self.customer_email, self.email]
            .into_iter()
            .flatten()
            .find(|raw| !raw.trim().is_empty())
    }

    pub(super) fn into_contact(self) -> Option<CustomerContact> {
        self.into_raw().and_then(CustomerContact::parse)
    }
}

/// Money amount represented in cents to avoid floating point issues.
///
/// On the wire money is a decimal number of major units (`20`, `19.99`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct Money {
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the whole-unit portion.
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.cents.abs() % 100
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }
}

impl TryFrom<f64> for Money {
    type Error = OrderError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        let cents = (value * 100.0).round();
        if !cents.is_finite() || cents.abs() >= i64::MAX as f64 {
            return Err(OrderError::InvalidAmount { value });
        }
        Ok(Self {
            cents: cents as i64,
        })
    }
}

impl From<Money> for f64 {
    fn from(money: Money) -> Self {
        money.cents as f64 / 100.0
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}.{:02}", self.dollars().abs(), self.cents_part())
        } else {
            write!(f, "${}.{:02}", self.dollars(), self.cents_part())
        }
    }
}
