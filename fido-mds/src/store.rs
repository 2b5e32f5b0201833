//! The most recently loaded metadata, swapped whole on every successful load.

use crate::error::Result;
use crate::mds::{MetadataEntry, MetadataPayload};
use crate::refresh::Freshness;
use chrono::{DateTime, NaiveDate, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};

/// A verified, decoded payload and when it was loaded.
#[derive(Debug, Clone)]
pub struct MetadataSnapshot {
    payload: MetadataPayload,
    payload_text: String,
    updated_at: DateTime<Utc>,
}

impl MetadataSnapshot {
    /// Decode verified payload text.
    pub fn new(payload_text: String) -> Result<Self> {
        let payload = MetadataPayload::from_str(&payload_text)?;
        Ok(MetadataSnapshot {
            payload,
            payload_text,
            updated_at: Utc::now(),
        })
    }

    pub fn payload(&self) -> &MetadataPayload {
        &self.payload
    }

    /// The payload exactly as it was released by the envelope.
    pub fn payload_text(&self) -> &str {
        &self.payload_text
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn legal_header(&self) -> &str {
        self.payload.legal_header()
    }

    pub fn serial_number(&self) -> u64 {
        self.payload.serial_number()
    }

    pub fn next_update(&self) -> NaiveDate {
        self.payload.next_update()
    }

    pub fn entries(&self) -> &[MetadataEntry] {
        self.payload.entries()
    }
}

/// The ways an identifier is looked up, in the order they are attempted when
/// the kind of identifier is not known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    ByAaguid,
    ByAaid,
    ByAttestationCertificateKeyIdentifier,
}

impl LookupStrategy {
    pub const ORDER: [LookupStrategy; 3] = [
        LookupStrategy::ByAaguid,
        LookupStrategy::ByAaid,
        LookupStrategy::ByAttestationCertificateKeyIdentifier,
    ];

    pub fn find<'a>(self, payload: &'a MetadataPayload, id: &str) -> Option<&'a MetadataEntry> {
        match self {
            LookupStrategy::ByAaguid => payload.find_by_aaguid(id),
            LookupStrategy::ByAaid => payload.find_by_aaid(id),
            LookupStrategy::ByAttestationCertificateKeyIdentifier => {
                payload.find_by_attestation_certificate_key_identifier(id)
            }
        }
    }

    /// The name of the identifier this strategy takes.
    pub fn parameter(self) -> &'static str {
        match self {
            LookupStrategy::ByAaguid => "aaguid",
            LookupStrategy::ByAaid => "aaid",
            LookupStrategy::ByAttestationCertificateKeyIdentifier => {
                "attestationCertificateKeyIdentifier"
            }
        }
    }
}

impl fmt::Display for LookupStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "by {}", self.parameter())
    }
}

/// Readers see either the previous or the next snapshot, never a mix.
#[derive(Debug, Default)]
pub struct MetadataStore {
    state: RwLock<Option<Arc<MetadataSnapshot>>>,
}

impl MetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<MetadataSnapshot>> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, snapshot: Arc<MetadataSnapshot>) {
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Some(snapshot);
    }

    pub fn freshness(&self) -> Freshness {
        Freshness::now(self.snapshot().map(|s| s.next_update()))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::fixtures::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;

    fn payload_text(blob: &str) -> String {
        let segment = blob.trim().split('.').nth(1).unwrap();
        String::from_utf8(URL_SAFE_NO_PAD.decode(segment).unwrap()).unwrap()
    }

    #[test]
    fn store_swaps_whole_snapshots() {
        let store = MetadataStore::new();
        assert!(store.snapshot().is_none());
        assert_eq!(store.freshness(), Freshness::Absent);

        store.replace(Arc::new(
            MetadataSnapshot::new(payload_text(BLOB_STALE)).unwrap(),
        ));
        let stale = store.snapshot().unwrap();
        assert_eq!(stale.serial_number(), 4);
        assert_eq!(
            store.freshness(),
            Freshness::Stale(NaiveDate::from_ymd_opt(2000, 1, 1).unwrap())
        );

        store.replace(Arc::new(MetadataSnapshot::new(payload_text(BLOB)).unwrap()));
        assert_eq!(store.freshness(), Freshness::Fresh);
        assert_eq!(store.snapshot().unwrap().serial_number(), 5);
        // Holders of the old snapshot are unaffected.
        assert_eq!(stale.serial_number(), 4);
        assert_eq!(stale.legal_header(), "L");
    }

    #[test]
    fn snapshot_keeps_payload_text() {
        let text = payload_text(BLOB);
        let snapshot = MetadataSnapshot::new(text.clone()).unwrap();
        assert_eq!(snapshot.payload_text(), text);
        assert_eq!(snapshot.entries().len(), 4);
        assert!(snapshot.updated_at() <= Utc::now());
    }

    #[test]
    fn strategies_in_order() {
        let snapshot = MetadataSnapshot::new(payload_text(BLOB)).unwrap();
        let payload = snapshot.payload();
        let hits: Vec<_> = LookupStrategy::ORDER
            .iter()
            .map(|s| s.find(payload, U2F_AKI).is_some())
            .collect();
        assert_eq!(hits, vec![false, false, true]);
        assert!(LookupStrategy::ByAaguid.find(payload, FIDO2_AAGUID).is_some());
        assert!(LookupStrategy::ByAaid.find(payload, FIDO2_AAGUID).is_none());
        assert_eq!(LookupStrategy::ByAaid.to_string(), "by aaid");
    }
}
