//! Types for the payload of the fido metadata service blob as defined by
//! <https://fidoalliance.org/specs/mds/fido-metadata-service-v3.0-ps-20210518.html>
//!
//! Entries are validated as they are decoded. Each must identify exactly one
//! authenticator model through an aaguid (fido2), an aaid (uaf) or a list of
//! attestation certificate key identifiers (u2f). Entries that do not are
//! quarantined by [MetadataPayload] rather than trusted.

use crate::error::{MdsError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// The family of protocols this device belongs to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProtocolFamily {
    /// No protocol family was provided
    #[default]
    Unknown,
    /// Uaf
    #[serde(rename = "uaf")]
    Uaf,
    /// Universal Second Factor
    #[serde(rename = "u2f")]
    U2f,
    /// Fido 2. This is the preferred type
    #[serde(rename = "fido2")]
    Fido2,
}

/// The fido certification status of the device associated to this aaid/aaguid.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum AuthenticatorStatus {
    /// The device is NOT fido certified
    #[serde(rename = "NOT_FIDO_CERTIFIED")]
    NotFidoCertified,
    /// The device is fido certified. This is being phased out in favour of FIDO_CERTIFIED_L1.
    #[serde(rename = "FIDO_CERTIFIED")]
    FidoCertified,
    /// Malware is able to bypass the user verification.
    #[serde(rename = "USER_VERIFICATION_BYPASS")]
    UserVerificationBypass,
    /// An attestation key for this authenticator is known to be compromised.
    #[serde(rename = "ATTESTATION_KEY_COMPROMISE")]
    AttestationKeyCompromise,
    /// Registered keys can be compromised remotely and should not be trusted.
    #[serde(rename = "USER_KEY_REMOTE_COMPROMISE")]
    UserKeyRemoteCompromise,
    /// User keys can be extracted by an adversary in physical possession of the device.
    #[serde(rename = "USER_KEY_PHYSICAL_COMPROMISE")]
    UserKeyPhysicalCompromise,
    /// A software or firmware update is available for the device.
    #[serde(rename = "UPDATE_AVAILABLE")]
    UpdateAvailable,
    /// The FIDO Alliance has determined that this authenticator should not be trusted for any
    /// reason.
    #[serde(rename = "REVOKED")]
    Revoked,
    /// The vendor has submitted the self-certification checklist.
    #[serde(rename = "SELF_ASSERTION_SUBMITTED")]
    SelfAssertionSubmitted,
    /// This device is certified at level 1
    #[serde(rename = "FIDO_CERTIFIED_L1")]
    FidoCertifiedL1,
    /// This device is certified at level 1 plus
    #[serde(rename = "FIDO_CERTIFIED_L1plus")]
    FidoCertifiedL1Plus,
    /// This device is certified at level 2
    #[serde(rename = "FIDO_CERTIFIED_L2")]
    FidoCertifiedL2,
    /// This device is certified at level 2 plus
    #[serde(rename = "FIDO_CERTIFIED_L2plus")]
    FidoCertifiedL2Plus,
    /// This device is certified at level 3
    #[serde(rename = "FIDO_CERTIFIED_L3")]
    FidoCertifiedL3,
    /// This device is certified at level 3 plus
    #[serde(rename = "FIDO_CERTIFIED_L3plus")]
    FidoCertifiedL3Plus,
}

impl AuthenticatorStatus {
    /// The name used for this status in the metadata blob.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthenticatorStatus::NotFidoCertified => "NOT_FIDO_CERTIFIED",
            AuthenticatorStatus::FidoCertified => "FIDO_CERTIFIED",
            AuthenticatorStatus::UserVerificationBypass => "USER_VERIFICATION_BYPASS",
            AuthenticatorStatus::AttestationKeyCompromise => "ATTESTATION_KEY_COMPROMISE",
            AuthenticatorStatus::UserKeyRemoteCompromise => "USER_KEY_REMOTE_COMPROMISE",
            AuthenticatorStatus::UserKeyPhysicalCompromise => "USER_KEY_PHYSICAL_COMPROMISE",
            AuthenticatorStatus::UpdateAvailable => "UPDATE_AVAILABLE",
            AuthenticatorStatus::Revoked => "REVOKED",
            AuthenticatorStatus::SelfAssertionSubmitted => "SELF_ASSERTION_SUBMITTED",
            AuthenticatorStatus::FidoCertifiedL1 => "FIDO_CERTIFIED_L1",
            AuthenticatorStatus::FidoCertifiedL1Plus => "FIDO_CERTIFIED_L1plus",
            AuthenticatorStatus::FidoCertifiedL2 => "FIDO_CERTIFIED_L2",
            AuthenticatorStatus::FidoCertifiedL2Plus => "FIDO_CERTIFIED_L2plus",
            AuthenticatorStatus::FidoCertifiedL3 => "FIDO_CERTIFIED_L3",
            AuthenticatorStatus::FidoCertifiedL3Plus => "FIDO_CERTIFIED_L3plus",
        }
    }

    /// Position of this status in the certification ladder. Every status that
    /// is not a certification ranks 0, below the legacy `FIDO_CERTIFIED`.
    pub fn certification_rank(self) -> u8 {
        match self {
            AuthenticatorStatus::NotFidoCertified
            | AuthenticatorStatus::UserVerificationBypass
            | AuthenticatorStatus::AttestationKeyCompromise
            | AuthenticatorStatus::UserKeyRemoteCompromise
            | AuthenticatorStatus::UserKeyPhysicalCompromise
            | AuthenticatorStatus::UpdateAvailable
            | AuthenticatorStatus::Revoked
            | AuthenticatorStatus::SelfAssertionSubmitted => 0,
            AuthenticatorStatus::FidoCertified => 5,
            AuthenticatorStatus::FidoCertifiedL1 => 10,
            AuthenticatorStatus::FidoCertifiedL1Plus => 11,
            AuthenticatorStatus::FidoCertifiedL2 => 20,
            AuthenticatorStatus::FidoCertifiedL2Plus => 21,
            AuthenticatorStatus::FidoCertifiedL3 => 30,
            AuthenticatorStatus::FidoCertifiedL3Plus => 31,
        }
    }
}

impl fmt::Display for AuthenticatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthenticatorStatus {
    type Err = MdsError;

    /// Accepts the blob names (`FIDO_CERTIFIED_L1`) as well as the short
    /// forms used in queries (`l1`, `revoked`, `update-available`).
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "not_fido_certified" | "not-certified" => Ok(AuthenticatorStatus::NotFidoCertified),
            "fido_certified" | "certified" => Ok(AuthenticatorStatus::FidoCertified),
            "user_verification_bypass" | "uv-bypass" => {
                Ok(AuthenticatorStatus::UserVerificationBypass)
            }
            "attestation_key_compromise" | "key-compromise" => {
                Ok(AuthenticatorStatus::AttestationKeyCompromise)
            }
            "user_key_remote_compromise" | "remote-exploit" => {
                Ok(AuthenticatorStatus::UserKeyRemoteCompromise)
            }
            "user_key_physical_compromise" | "physical-compromise" => {
                Ok(AuthenticatorStatus::UserKeyPhysicalCompromise)
            }
            "update_available" | "update-available" => Ok(AuthenticatorStatus::UpdateAvailable),
            "revoked" => Ok(AuthenticatorStatus::Revoked),
            "self_assertion_submitted" | "self-asserted" => {
                Ok(AuthenticatorStatus::SelfAssertionSubmitted)
            }
            "fido_certified_l1" | "valid" | "l1" => Ok(AuthenticatorStatus::FidoCertifiedL1),
            "fido_certified_l1plus" | "l1+" => Ok(AuthenticatorStatus::FidoCertifiedL1Plus),
            "fido_certified_l2" | "l2" => Ok(AuthenticatorStatus::FidoCertifiedL2),
            "fido_certified_l2plus" | "l2+" => Ok(AuthenticatorStatus::FidoCertifiedL2Plus),
            "fido_certified_l3" | "l3" => Ok(AuthenticatorStatus::FidoCertifiedL3),
            "fido_certified_l3plus" | "l3+" => Ok(AuthenticatorStatus::FidoCertifiedL3Plus),
            _ => Err(MdsError::Parse(format!("Unknown authenticator status {s}."))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Contains an AuthenticatorStatus and additional data associated with it, if any.
pub struct StatusReport {
    /// The status of the authenticator.
    pub status: AuthenticatorStatus,
    /// ISO-8601 formatted date since when the status code was set, if applicable. If no date is
    /// given, the status is assumed to be effective while present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_date: Option<String>,
    /// The authenticatorVersion that this status report relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_version: Option<u32>,
    /// Base64 (not base64url) DER certificate related to the current status, if applicable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// HTTPS URL where additional information may be found related to the current status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_descriptor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_policy_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certification_requirements_version: Option<String>,
}

impl StatusReport {
    /// The effective date, if one is present and is a valid `YYYY-MM-DD` date.
    pub fn effective_date(&self) -> Option<NaiveDate> {
        self.effective_date
            .as_deref()
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// A statement describing a device and it's associated properties. Only the
/// fields needed to identify and describe the device are typed, the rest are
/// carried through untouched.
pub struct MetadataStatement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aaid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aaguid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_certificate_key_identifiers: Option<Vec<String>>,
    /// A human-readable, short description of the authenticator, in English.
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_version: Option<u32>,
    #[serde(default)]
    pub protocol_family: ProtocolFamily,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<u16>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// An entry of the metadata blob as it appears on the wire, before its
/// identity has been validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aaid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aaguid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_certificate_key_identifiers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_statement: Option<MetadataStatement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub biometric_status_reports: Vec<serde_json::Value>,
    #[serde(default)]
    pub status_reports: Vec<StatusReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_of_last_status_change: Option<String>,
    #[serde(
        default,
        rename = "rogueListURL",
        skip_serializing_if = "Option::is_none"
    )]
    pub rogue_list_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rogue_list_hash: Option<String>,
}

/// The identifier of an authenticator model. Exactly one applies per entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryIdentity {
    Fido2(Uuid),
    Uaf(String),
    U2f(Vec<String>),
}

impl fmt::Display for EntryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryIdentity::Fido2(u) => write!(f, "aaguid {u}"),
            EntryIdentity::Uaf(a) => write!(f, "aaid {a}"),
            EntryIdentity::U2f(k) => write!(f, "aki {}", k.join(",")),
        }
    }
}

/// Why an entry was not accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EntryRejection {
    #[error("entry has no aaguid, aaid or attestation certificate key identifiers")]
    NoIdentity,
    #[error("entry carries more than one kind of identifier")]
    AmbiguousIdentity,
    #[error("entry identifiers differ between the entry and its metadata statement")]
    ConflictingIdentity,
    #[error("aaguid {0} is not a valid uuid")]
    InvalidAaguid(String),
    #[error("entry has an empty attestation certificate key identifier list")]
    EmptyKeyIdentifiers,
    #[error("entry has no status reports")]
    NoStatusReports,
}

/// Picks the identifier of one kind from the entry and its statement. Both
/// must agree when both are present.
fn pick<T: PartialEq>(
    top: Option<T>,
    nested: Option<T>,
) -> std::result::Result<Option<T>, EntryRejection> {
    match (top, nested) {
        (Some(t), Some(n)) if t != n => Err(EntryRejection::ConflictingIdentity),
        (Some(t), _) => Ok(Some(t)),
        (None, n) => Ok(n),
    }
}

fn parse_aaguid(s: String) -> std::result::Result<Uuid, EntryRejection> {
    Uuid::parse_str(&s).map_err(|_| EntryRejection::InvalidAaguid(s))
}

impl TryFrom<&RawEntry> for EntryIdentity {
    type Error = EntryRejection;

    fn try_from(raw: &RawEntry) -> std::result::Result<Self, Self::Error> {
        let statement = raw.metadata_statement.as_ref();

        let aaguid = pick(
            raw.aaguid.clone().map(parse_aaguid).transpose()?,
            statement
                .and_then(|s| s.aaguid.clone())
                .map(parse_aaguid)
                .transpose()?,
        )?;
        let aaid = pick(
            raw.aaid.clone(),
            statement.and_then(|s| s.aaid.clone()),
        )?;
        let aki = pick(
            raw.attestation_certificate_key_identifiers.clone(),
            statement.and_then(|s| s.attestation_certificate_key_identifiers.clone()),
        )?;

        match (aaguid, aaid, aki) {
            (Some(u), None, None) => Ok(EntryIdentity::Fido2(u)),
            (None, Some(a), None) => Ok(EntryIdentity::Uaf(a)),
            (None, None, Some(k)) if k.is_empty() => Err(EntryRejection::EmptyKeyIdentifiers),
            (None, None, Some(k)) => Ok(EntryIdentity::U2f(k)),
            (None, None, None) => Err(EntryRejection::NoIdentity),
            _ => Err(EntryRejection::AmbiguousIdentity),
        }
    }
}

/// One authenticator model's record, with a validated identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawEntry", into = "RawEntry")]
pub struct MetadataEntry {
    identity: EntryIdentity,
    raw: RawEntry,
}

impl TryFrom<RawEntry> for MetadataEntry {
    type Error = EntryRejection;

    fn try_from(raw: RawEntry) -> std::result::Result<Self, Self::Error> {
        let identity = EntryIdentity::try_from(&raw)?;
        if raw.status_reports.is_empty() {
            return Err(EntryRejection::NoStatusReports);
        }
        Ok(MetadataEntry { identity, raw })
    }
}

impl From<MetadataEntry> for RawEntry {
    fn from(entry: MetadataEntry) -> Self {
        entry.raw
    }
}

impl MetadataEntry {
    pub fn identity(&self) -> &EntryIdentity {
        &self.identity
    }

    pub fn aaguid(&self) -> Option<Uuid> {
        match &self.identity {
            EntryIdentity::Fido2(u) => Some(*u),
            _ => None,
        }
    }

    pub fn aaid(&self) -> Option<&str> {
        match &self.identity {
            EntryIdentity::Uaf(a) => Some(a.as_str()),
            _ => None,
        }
    }

    pub fn attestation_certificate_key_identifiers(&self) -> Option<&[String]> {
        match &self.identity {
            EntryIdentity::U2f(k) => Some(k.as_slice()),
            _ => None,
        }
    }

    pub fn metadata_statement(&self) -> Option<&MetadataStatement> {
        self.raw.metadata_statement.as_ref()
    }

    /// The description from the metadata statement, if there is one.
    pub fn description(&self) -> Option<&str> {
        self.metadata_statement().map(|s| s.description.as_str())
    }

    pub fn status_reports(&self) -> &[StatusReport] {
        &self.raw.status_reports
    }

    pub fn time_of_last_status_change(&self) -> Option<&str> {
        self.raw.time_of_last_status_change.as_deref()
    }

    pub fn raw(&self) -> &RawEntry {
        &self.raw
    }

    pub fn matches_aaguid(&self, aaguid: &Uuid) -> bool {
        self.aaguid().as_ref() == Some(aaguid)
    }

    /// AAIDs and key identifiers compare exactly, as published.
    pub fn matches_aaid(&self, aaid: &str) -> bool {
        self.aaid() == Some(aaid)
    }

    pub fn matches_attestation_certificate_key_identifier(&self, aki: &str) -> bool {
        self.attestation_certificate_key_identifiers()
            .is_some_and(|keys| keys.iter().any(|k| k == aki))
    }

    /// The report reflecting the current status of the device.
    ///
    /// Dated reports outrank undated ones and newer dates outrank older ones.
    /// Reports sharing a date are ordered by [AuthenticatorStatus::certification_rank],
    /// and any remaining tie goes to the report published later.
    pub fn latest_status_report(&self) -> Option<&StatusReport> {
        self.raw
            .status_reports
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.effective_date()
                    .cmp(&b.effective_date())
                    .then_with(|| {
                        a.status
                            .certification_rank()
                            .cmp(&b.status.certification_rank())
                    })
                    .then_with(|| ia.cmp(ib))
            })
            .map(|(_, report)| report)
    }

    pub fn latest_status(&self) -> Option<AuthenticatorStatus> {
        self.latest_status_report().map(|r| r.status)
    }
}

impl fmt::Display for MetadataEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_string_pretty(&self.raw).map_err(|_| fmt::Error)?;
        write!(f, "MetadataEntry {s}")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPayload {
    legal_header: String,
    no: u64,
    next_update: NaiveDate,
    entries: Vec<serde_json::Value>,
}

/// The decoded content of a verified metadata blob.
#[derive(Debug, Clone)]
pub struct MetadataPayload {
    legal_header: String,
    no: u64,
    next_update: NaiveDate,
    entries: Vec<MetadataEntry>,
    quarantined: usize,
}

impl FromStr for MetadataPayload {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self> {
        let raw: RawPayload = serde_json::from_str(s)?;

        let mut entries = Vec::with_capacity(raw.entries.len());
        let mut quarantined = 0;
        for (index, value) in raw.entries.into_iter().enumerate() {
            match serde_json::from_value::<MetadataEntry>(value) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(index, %err, "quarantining metadata entry");
                    quarantined += 1;
                }
            }
        }

        debug!(
            no = raw.no,
            next_update = %raw.next_update,
            entries = entries.len(),
            quarantined,
            "decoded metadata payload"
        );

        Ok(MetadataPayload {
            legal_header: raw.legal_header,
            no: raw.no,
            next_update: raw.next_update,
            entries,
            quarantined,
        })
    }
}

impl MetadataPayload {
    pub fn legal_header(&self) -> &str {
        &self.legal_header
    }

    /// The serial number of this blob. Successive blobs increment it by one.
    pub fn serial_number(&self) -> u64 {
        self.no
    }

    pub fn next_update(&self) -> NaiveDate {
        self.next_update
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        &self.entries
    }

    /// Number of entries dropped while decoding because their identity was
    /// missing, ambiguous or malformed.
    pub fn quarantined(&self) -> usize {
        self.quarantined
    }

    /// First entry identified by `aaguid`. A value that is not a uuid matches nothing.
    pub fn find_by_aaguid(&self, aaguid: &str) -> Option<&MetadataEntry> {
        let aaguid = Uuid::parse_str(aaguid.trim()).ok()?;
        self.entries.iter().find(|e| e.matches_aaguid(&aaguid))
    }

    pub fn find_by_aaid(&self, aaid: &str) -> Option<&MetadataEntry> {
        self.entries.iter().find(|e| e.matches_aaid(aaid))
    }

    pub fn find_by_attestation_certificate_key_identifier(
        &self,
        aki: &str,
    ) -> Option<&MetadataEntry> {
        self.entries
            .iter()
            .find(|e| e.matches_attestation_certificate_key_identifier(aki))
    }
}
