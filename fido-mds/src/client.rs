//! The metadata service client: loads verified metadata according to its
//! [ClientConfig] and answers lookups, refreshing as the [RefreshOption]
//! of each lookup allows.

use crate::config::{ClientConfig, MdsAccess, RootAccess};
use crate::envelope::EnvelopeDecoder;
use crate::error::{MdsError, Result};
use crate::fetch::{Fetch, HttpFetcher};
use crate::mds::MetadataEntry;
use crate::query::Query;
use crate::refresh::{RefreshAction, RefreshOption};
use crate::store::{LookupStrategy, MetadataSnapshot, MetadataStore};
use crate::trust::TrustRootStore;
use std::fs;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, trace, warn};

pub struct MdsClient {
    config: ClientConfig,
    trust: TrustRootStore,
    fetcher: Arc<dyn Fetch>,
    store: MetadataStore,
    refresh_lock: Mutex<()>,
}

impl MdsClient {
    /// A client fetching over HTTP. Nothing is loaded until the first lookup
    /// or [MdsClient::refresh].
    pub fn new(config: ClientConfig) -> Result<Self> {
        Ok(Self::with_fetcher(config, Arc::new(HttpFetcher::new()?)))
    }

    pub fn with_fetcher(config: ClientConfig, fetcher: Arc<dyn Fetch>) -> Self {
        let trust = TrustRootStore::new(config.default_root().clone());
        MdsClient {
            config,
            trust,
            fetcher,
            store: MetadataStore::new(),
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn trust_root_store(&self) -> &TrustRootStore {
        &self.trust
    }

    /// The currently loaded metadata, if any.
    pub fn snapshot(&self) -> Option<Arc<MetadataSnapshot>> {
        self.store.snapshot()
    }

    /// Load the metadata now, regardless of how fresh the current copy is.
    pub fn refresh(&self) -> Result<()> {
        let _guard = self
            .refresh_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.load()
    }

    /// Must be called with `refresh_lock` held. The store is only replaced
    /// once the new payload has been verified and decoded.
    fn load(&self) -> Result<()> {
        let config = &self.config;
        let fetcher = self.fetcher.as_ref();

        self.trust.detach();
        match config.access_root_certificate() {
            RootAccess::Url => self.trust.set_from_url(config.root_url(), fetcher)?,
            RootAccess::File => self.trust.set_from_file(config.root_file())?,
            RootAccess::Pem => {
                let pem = config.root_pem().ok_or_else(|| {
                    MdsError::Setting("Please set root certificate pem.".to_string())
                })?;
                self.trust.set_from_pem(pem)?
            }
        }

        let envelope = match config.access_mds() {
            MdsAccess::Url => fetcher.fetch_text(config.mds_url())?,
            MdsAccess::File => {
                let path = config.mds_file();
                fs::read_to_string(path).map_err(|err| {
                    error!(?err, ?path, "unable to read metadata blob");
                    MdsError::Access(format!("Unable to read {}: {err}", path.display()))
                })?
            }
            MdsAccess::Jwt => config
                .mds_jwt()
                .ok_or_else(|| MdsError::Setting("Please set mds jwt.".to_string()))?
                .to_string(),
        };

        let payload_text = EnvelopeDecoder::new(&self.trust, fetcher).verify_and_decode(&envelope)?;
        let snapshot = MetadataSnapshot::new(payload_text)?;

        if let Some(path) = config.payload_file() {
            if let Err(err) = fs::write(path, snapshot.payload_text()) {
                warn!(?err, ?path, "unable to save metadata payload");
            }
        }

        info!(
            no = snapshot.serial_number(),
            next_update = %snapshot.next_update(),
            entries = snapshot.entries().len(),
            "metadata loaded"
        );
        self.store.replace(Arc::new(snapshot));
        Ok(())
    }

    /// Apply `option` to the current state, reloading if it asks for it.
    fn ensure_fresh(&self, option: RefreshOption) -> Result<Arc<MetadataSnapshot>> {
        if option.decide(self.store.freshness())? == RefreshAction::Reload {
            let _guard = self
                .refresh_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            // Someone else may have reloaded while we waited.
            if option == RefreshOption::Force || !self.store.freshness().is_fresh() {
                self.load()?;
            } else {
                debug!("metadata was reloaded concurrently");
            }
        }
        self.current()
    }

    fn current(&self) -> Result<Arc<MetadataSnapshot>> {
        self.store
            .snapshot()
            .ok_or_else(|| MdsError::Setting("Metadata cannot be fetched.".to_string()))
    }

    fn find(
        &self,
        strategy: LookupStrategy,
        id: &str,
        option: RefreshOption,
    ) -> Result<Option<MetadataEntry>> {
        if id.is_empty() {
            return Err(MdsError::InvalidParameter(format!(
                "\"{}\" is empty.",
                strategy.parameter()
            )));
        }
        let snapshot = self.ensure_fresh(option)?;
        Ok(strategy.find(snapshot.payload(), id).cloned())
    }

    /// Find a FIDO2 authenticator by its AAGUID.
    pub fn find_by_aaguid(
        &self,
        aaguid: &str,
        refresh: impl Into<RefreshOption>,
    ) -> Result<Option<MetadataEntry>> {
        self.find(LookupStrategy::ByAaguid, aaguid, refresh.into())
    }

    /// Find a FIDO UAF authenticator by its AAID.
    pub fn find_by_aaid(
        &self,
        aaid: &str,
        refresh: impl Into<RefreshOption>,
    ) -> Result<Option<MetadataEntry>> {
        self.find(LookupStrategy::ByAaid, aaid, refresh.into())
    }

    /// Find a FIDO U2F authenticator by one of its attestation certificate key
    /// identifiers.
    pub fn find_by_attestation_certificate_key_identifier(
        &self,
        aki: &str,
        refresh: impl Into<RefreshOption>,
    ) -> Result<Option<MetadataEntry>> {
        self.find(
            LookupStrategy::ByAttestationCertificateKeyIdentifier,
            aki,
            refresh.into(),
        )
    }

    /// Find an authenticator by an identifier of unknown kind, trying it as
    /// an AAGUID, then an AAID, then a key identifier. The refresh option is
    /// applied to the first attempt only.
    pub fn find_metadata(
        &self,
        identifier: &str,
        refresh: impl Into<RefreshOption>,
    ) -> Result<Option<MetadataEntry>> {
        if identifier.is_empty() {
            return Err(MdsError::InvalidParameter(
                "\"identifier\" is empty.".to_string(),
            ));
        }
        let option = refresh.into();

        let mut already_refreshed = false;
        for strategy in LookupStrategy::ORDER {
            let snapshot = if already_refreshed {
                self.current()?
            } else {
                already_refreshed = true;
                self.ensure_fresh(option)?
            };
            trace!(%strategy, %identifier, "attempting lookup");
            if let Some(entry) = strategy.find(snapshot.payload(), identifier) {
                return Ok(Some(entry.clone()));
            }
        }
        Ok(None)
    }

    /// All entries matching a query, see [crate::query].
    pub fn query(
        &self,
        query: &str,
        refresh: impl Into<RefreshOption>,
    ) -> Result<Vec<MetadataEntry>> {
        let query = Query::from_str(query)
            .map_err(|e| MdsError::InvalidParameter(format!("Invalid query: {e}")))?;
        let snapshot = self.ensure_fresh(refresh.into())?;
        Ok(snapshot
            .entries()
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::ClientConfigBuilder;
    use crate::error::ErrorKind;
    use crate::fetch::testutil::StaticFetcher;
    use crate::fixtures::*;
    use crate::mds::AuthenticatorStatus;
    use chrono::NaiveDate;

    /// A client reading the blob and root from their urls on `fetcher`.
    fn url_client(fetcher: &Arc<StaticFetcher>) -> MdsClient {
        ClientConfigBuilder::new()
            .unwrap()
            .mds_url(MDS_URL)
            .unwrap()
            .root_url(ROOT_URL)
            .unwrap()
            .build_with_fetcher(fetcher.clone())
    }

    #[test]
    fn round_trip() {
        let _ = tracing_subscriber::fmt::try_init();
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        assert!(client.snapshot().is_none());

        let entry = client.find_by_aaguid(FIDO2_AAGUID, false).unwrap().unwrap();
        assert_eq!(entry.aaguid().unwrap().to_string(), FIDO2_AAGUID);
        assert_eq!(entry.latest_status(), Some(AuthenticatorStatus::FidoCertifiedL1));
        assert!(client.find_by_aaguid("not-present", false).unwrap().is_none());

        let snapshot = client.snapshot().unwrap();
        assert_eq!(snapshot.legal_header(), "L");
        assert_eq!(snapshot.serial_number(), 5);
        assert_eq!(
            snapshot.next_update(),
            NaiveDate::from_ymd_opt(2099, 1, 1).unwrap()
        );
        assert_eq!(fetcher.hits(MDS_URL), 1);
        assert_eq!(fetcher.hits(ROOT_URL), 1);
    }

    #[test]
    fn lookups_by_each_identifier() {
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        client.refresh().unwrap();

        assert!(client
            .find_by_aaguid(NESTED_FIDO2_AAGUID, RefreshOption::Error)
            .unwrap()
            .is_some());
        assert!(client.find_by_aaid(UAF_AAID, "needed".parse::<RefreshOption>().unwrap())
            .unwrap()
            .is_some());
        assert!(client
            .find_by_attestation_certificate_key_identifier(U2F_AKI, false)
            .unwrap()
            .is_some());
        assert!(client.find_by_aaid(FIDO2_AAGUID, false).unwrap().is_none());
        assert!(client
            .find_by_attestation_certificate_key_identifier(UAF_AAID, false)
            .unwrap()
            .is_none());
        assert_eq!(fetcher.hits(MDS_URL), 1);
    }

    #[test]
    fn empty_identifiers_are_invalid() {
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        for result in [
            client.find_by_aaguid("", false),
            client.find_by_aaid("", false),
            client.find_by_attestation_certificate_key_identifier("", false),
            client.find_metadata("", false),
        ] {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidParameter);
        }
        // Nothing was loaded to answer these.
        assert_eq!(fetcher.hits(MDS_URL), 0);
    }

    #[test]
    fn stale_data_reloads_once_when_needed() {
        let _ = tracing_subscriber::fmt::try_init();
        let fetcher = Arc::new(metadata_service(BLOB_STALE));
        let client = url_client(&fetcher);
        client.refresh().unwrap();
        assert_eq!(client.snapshot().unwrap().serial_number(), 4);
        assert_eq!(fetcher.hits(MDS_URL), 1);

        fetcher.insert(MDS_URL, BLOB.as_bytes());
        let entry = client
            .find_by_aaguid(FIDO2_AAGUID, RefreshOption::Needed)
            .unwrap();
        assert!(entry.is_some());
        assert_eq!(fetcher.hits(MDS_URL), 2);
        assert_eq!(client.snapshot().unwrap().serial_number(), 5);

        client
            .find_by_aaguid(FIDO2_AAGUID, RefreshOption::Needed)
            .unwrap();
        assert_eq!(fetcher.hits(MDS_URL), 2);
    }

    #[test]
    fn stale_data_errors_without_reload() {
        let fetcher = Arc::new(metadata_service(BLOB_STALE));
        let client = url_client(&fetcher);
        client.refresh().unwrap();

        let err = client
            .find_by_aaguid(FIDO2_AAGUID, RefreshOption::Error)
            .unwrap_err();
        assert!(matches!(
            err,
            MdsError::StaleData { next_update: Some(d) } if d == NaiveDate::from_ymd_opt(2000, 1, 1).unwrap()
        ));
        assert_eq!(err.to_string(), "Metadata is old. Update at 2000-01-01");
        assert_eq!(fetcher.hits(MDS_URL), 1);

        // error mode applies to every attempt of find_metadata.
        assert_eq!(
            client
                .find_metadata(U2F_AKI, RefreshOption::Error)
                .unwrap_err()
                .kind(),
            ErrorKind::StaleData
        );
        assert_eq!(fetcher.hits(MDS_URL), 1);
    }

    #[test]
    fn nothing_loaded_in_error_mode() {
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        let err = client
            .find_by_aaid(UAF_AAID, RefreshOption::Error)
            .unwrap_err();
        assert!(matches!(err, MdsError::StaleData { next_update: None }));
        assert_eq!(fetcher.hits(MDS_URL), 0);
    }

    #[test]
    fn find_metadata_falls_through_with_one_reload() {
        let _ = tracing_subscriber::fmt::try_init();
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        client.refresh().unwrap();
        assert_eq!(fetcher.hits(MDS_URL), 1);

        let entry = client
            .find_metadata(U2F_AKI, RefreshOption::Force)
            .unwrap()
            .unwrap();
        assert!(entry
            .attestation_certificate_key_identifiers()
            .unwrap()
            .contains(&U2F_AKI.to_string()));
        assert_eq!(fetcher.hits(MDS_URL), 2);

        // A stale payload still reloads only once per call.
        fetcher.insert(MDS_URL, BLOB_STALE.as_bytes());
        assert!(client
            .find_metadata("ffff#ffff", RefreshOption::Force)
            .unwrap()
            .is_none());
        assert_eq!(fetcher.hits(MDS_URL), 3);
        assert!(client
            .find_metadata(UAF_AAID, RefreshOption::Needed)
            .unwrap()
            .is_some());
        assert_eq!(fetcher.hits(MDS_URL), 4);
    }

    #[test]
    fn failed_reload_keeps_previous_state() {
        let _ = tracing_subscriber::fmt::try_init();
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        client.refresh().unwrap();
        let before = client.snapshot().unwrap();

        fetcher.insert(INTERMEDIATE_CRL_URL, INTERMEDIATE_REVOKED_CRL);
        let err = client.refresh().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RevokedCertificate);
        assert!(Arc::ptr_eq(&before, &client.snapshot().unwrap()));

        fetcher.insert(INTERMEDIATE_CRL_URL, INTERMEDIATE_CRL);
        fetcher.insert(MDS_URL, b"not a jws");
        let err = client.find_metadata(FIDO2_AAGUID, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedEnvelope);
        assert!(Arc::ptr_eq(&before, &client.snapshot().unwrap()));
    }

    #[test]
    fn file_and_pem_sources() {
        let dir = tempfile::tempdir().unwrap();
        let blob = dir.path().join("blob.jwt");
        let root = dir.path().join("root.der");
        let payload = dir.path().join("payload.json");
        std::fs::write(&blob, BLOB).unwrap();
        std::fs::write(&root, ROOT_DER).unwrap();

        let fetcher = Arc::new(clean_crls());
        let client = ClientConfigBuilder::new()
            .unwrap()
            .mds_file(&blob)
            .unwrap()
            .root_file(&root)
            .unwrap()
            .payload_file(&payload)
            .unwrap()
            .build_with_fetcher(fetcher.clone());
        client.refresh().unwrap();

        let saved = std::fs::read_to_string(&payload).unwrap();
        assert_eq!(saved, client.snapshot().unwrap().payload_text());

        let client = ClientConfigBuilder::new()
            .unwrap()
            .mds_jwt(BLOB)
            .unwrap()
            .root_pem(ROOT_PEM)
            .unwrap()
            .build_with_fetcher(fetcher.clone());
        assert!(client
            .find_metadata(UAF_AAID, false)
            .unwrap()
            .is_some());
        assert!(client.trust_root_store().current().is_some());
    }

    #[test]
    fn unwritable_payload_file_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = ClientConfigBuilder::new()
            .unwrap()
            .mds_url(MDS_URL)
            .unwrap()
            .root_url(ROOT_URL)
            .unwrap()
            .payload_file(dir.path().join("missing").join("payload.json"))
            .unwrap()
            .build_with_fetcher(fetcher);
        client.refresh().unwrap();
        assert!(client.snapshot().is_some());
    }

    #[test]
    fn missing_mode_values_are_setting_errors() {
        let fetcher = Arc::new(metadata_service(BLOB));

        let client = ClientConfigBuilder::new()
            .unwrap()
            .mds_jwt(BLOB)
            .unwrap()
            .access_root_certificate("pem")
            .unwrap()
            .build_with_fetcher(fetcher.clone());
        let err = client.refresh().unwrap_err();
        assert_eq!(err.to_string(), "setting error: Please set root certificate pem.");

        let client = ClientConfigBuilder::new()
            .unwrap()
            .root_pem(ROOT_PEM)
            .unwrap()
            .access_mds("jwt")
            .unwrap()
            .build_with_fetcher(fetcher);
        let err = client.find_by_aaguid(FIDO2_AAGUID, false).unwrap_err();
        assert_eq!(err.to_string(), "setting error: Please set mds jwt.");
    }

    #[test]
    fn unreachable_blob_is_an_access_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(clean_crls());
        let client = ClientConfigBuilder::new()
            .unwrap()
            .mds_file(dir.path().join("absent.jwt"))
            .unwrap()
            .root_pem(ROOT_PEM)
            .unwrap()
            .build_with_fetcher(fetcher.clone());
        assert_eq!(client.refresh().unwrap_err().kind(), ErrorKind::Access);

        let client = url_client(&fetcher);
        let err = client.refresh().unwrap_err();
        assert_eq!(err.to_string(), "access error: Request has error. Status code: 404");
    }

    #[test]
    fn query_entries() {
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = url_client(&fetcher);
        let certified = client.query("status eq l1", false).unwrap();
        assert_eq!(certified.len(), 2);
        assert_eq!(
            client.query("status eq revoked", false).unwrap().len(),
            0
        );
        assert_eq!(
            client.query("colour eq red", false).unwrap_err().kind(),
            ErrorKind::InvalidParameter
        );
        assert_eq!(fetcher.hits(MDS_URL), 1);
    }

    #[test]
    fn concurrent_lookups_share_one_reload() {
        let fetcher = Arc::new(metadata_service(BLOB));
        let client = Arc::new(url_client(&fetcher));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                std::thread::spawn(move || {
                    client
                        .find_by_aaguid(FIDO2_AAGUID, RefreshOption::Needed)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }
        assert_eq!(fetcher.hits(MDS_URL), 1);
    }
}
