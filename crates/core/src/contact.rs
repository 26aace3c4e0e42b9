//! Contact records and phone-number canonicalization.
//!
//! Every number entering the polling core passes through [`PhoneNumber`],
//! which normalizes and validates on construction. A record holding an
//! un-parsable number is therefore unrepresentable: the type system upholds
//! the invariant that only well-formed numbers reach a batch request.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

/// Minimum dialable characters in a canonical number.
const NUMBER_MIN_LEN: usize = 3;
/// Maximum dialable characters in a canonical number.
const NUMBER_MAX_LEN: usize = 15;

/// Errors from constructing a [`PhoneNumber`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PhoneNumberError {
    /// The input was empty or contained only whitespace/separators.
    #[error("phone number cannot be empty")]
    Empty,
    /// The input contains a character that is neither dialable nor a
    /// recognized separator.
    #[error("phone number contains non-dialable character {0:?}")]
    InvalidCharacter(char),
    /// The canonical form has too few or too many dialable characters.
    #[error(
        "phone number must have between {NUMBER_MIN_LEN} and {NUMBER_MAX_LEN} \
         dialable characters, got {0}"
    )]
    Length(usize),
}

/// A normalized, validated phone number.
///
/// Normalization rules:
/// - Leading/trailing whitespace is trimmed.
/// - A single leading `+` is preserved.
/// - Visual separators (space, `-`, `.`, `(`, `)`, `/`) are stripped.
/// - Vanity letters are lowercased, so comparison is case-insensitive.
///
/// After normalization the number must contain only digits, `a-z`, `*`, `#`
/// and have between 3 and 15 dialable characters.
///
/// # Examples
///
/// ```
/// use presence_core::PhoneNumber;
///
/// let number: PhoneNumber = "+1 (650) 555-0199".parse().unwrap();
/// assert_eq!(number.as_str(), "+16505550199");
///
/// let vanity: PhoneNumber = "1-800-FLOWERS".parse().unwrap();
/// assert_eq!(vanity.as_str(), "1800flowers");
/// ```
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PhoneNumber(String);

impl PhoneNumber {
    /// Canonical form of the number.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `tel:` URI used when submitting capability batches.
    #[must_use]
    pub fn to_tel_uri(&self) -> String {
        format!("tel:{}", self.0)
    }

    /// `sip:` URI within the given carrier domain.
    #[must_use]
    pub fn to_sip_uri(&self, domain: &str) -> String {
        format!("sip:{}@{domain}", self.0)
    }

    fn normalize(input: &str) -> Result<Self, PhoneNumberError> {
        let trimmed = input.trim();
        let mut canonical = String::with_capacity(trimmed.len());
        let mut dialable = 0usize;

        for (index, ch) in trimmed.chars().enumerate() {
            match ch {
                '+' if index == 0 => canonical.push('+'),
                ' ' | '-' | '.' | '(' | ')' | '/' => {}
                '0'..='9' | '*' | '#' => {
                    canonical.push(ch);
                    dialable += 1;
                }
                'a'..='z' | 'A'..='Z' => {
                    canonical.push(ch.to_ascii_lowercase());
                    dialable += 1;
                }
                other => return Err(PhoneNumberError::InvalidCharacter(other)),
            }
        }

        if canonical.is_empty() || canonical == "+" {
            return Err(PhoneNumberError::Empty);
        }
        if !(NUMBER_MIN_LEN..=NUMBER_MAX_LEN).contains(&dialable) {
            return Err(PhoneNumberError::Length(dialable));
        }
        Ok(Self(canonical))
    }
}

impl FromStr for PhoneNumber {
    type Err = PhoneNumberError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::normalize(s)
    }
}

impl TryFrom<&str> for PhoneNumber {
    type Error = PhoneNumberError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::normalize(value)
    }
}

impl TryFrom<String> for PhoneNumber {
    type Error = PhoneNumberError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::normalize(&value)
    }
}

impl From<PhoneNumber> for String {
    fn from(number: PhoneNumber) -> Self {
        number.0
    }
}

impl fmt::Display for PhoneNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A remotely-queryable attribute of a contact.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Voice-over-IP call support.
    IpVoiceCall,
    /// Video call support.
    IpVideoCall,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IpVoiceCall => write!(f, "ip-voice-call"),
            Self::IpVideoCall => write!(f, "ip-video-call"),
        }
    }
}

/// Last-known availability of a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    /// Never observed, or reset by a provisioning/SIM change.
    #[default]
    Unknown,
    Unavailable,
    Available,
}

/// Per-capability state on a contact record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityState {
    pub availability: Availability,
    /// When this capability was last confirmed by a poll result.
    pub updated: Timestamp,
    /// Service contact address reported for this capability, if any.
    pub contact_address: Option<String>,
}

impl CapabilityState {
    #[must_use]
    pub fn available(updated: Timestamp) -> Self {
        Self {
            availability: Availability::Available,
            updated,
            contact_address: None,
        }
    }
}

/// Opaque store-assigned contact identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact-{}", self.0)
    }
}

/// Persistent per-contact capability record, as handed out by the store.
///
/// The polling core never hard-deletes records; deletion belongs to the
/// contact-sync collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub id: ContactId,
    pub number: PhoneNumber,
    pub display_name: Option<String>,
    /// When any capability on this record last changed via a poll result.
    /// [`Timestamp::ZERO`] marks a contact that has never been polled.
    pub last_update: Timestamp,
    pub capabilities: BTreeMap<Capability, CapabilityState>,
}

impl ContactRecord {
    /// Freeze the fields the poll queue needs at enqueue time.
    #[must_use]
    pub fn snapshot(&self) -> ContactSnapshot {
        ContactSnapshot {
            number: self.number.clone(),
            last_update: self.last_update,
            capability_updates: self
                .capabilities
                .iter()
                .map(|(capability, state)| (*capability, state.updated))
                .collect(),
        }
    }
}

/// Frozen copy of a record taken when a poll task is created.
///
/// Tasks carry snapshots, never live records: a record mutated by a sync or
/// a concurrent poll result must not change an already-enqueued batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactSnapshot {
    pub number: PhoneNumber,
    pub last_update: Timestamp,
    pub capability_updates: BTreeMap<Capability, Timestamp>,
}
