//! Test material: a root, intermediate and leaf signing chain with matching
//! revocation lists, and metadata blobs signed by the leaf.
#![allow(clippy::unwrap_used)]

use crate::fetch::testutil::StaticFetcher;
use openssl::x509::X509;

pub(crate) const ROOT_PEM: &str = include_str!("../test_data/root.pem");
pub(crate) const ROOT_DER: &[u8] = include_bytes!("../test_data/root.der");
pub(crate) const EXPIRED_ROOT_DER: &[u8] = include_bytes!("../test_data/expired-root.der");

/// RS256, `no: 5`, `nextUpdate: 2099-01-01`.
pub(crate) const BLOB: &str = include_str!("../test_data/blob.jwt");
/// RS256, `no: 4`, `nextUpdate: 2000-01-01`.
pub(crate) const BLOB_STALE: &str = include_str!("../test_data/blob-stale.jwt");
/// ES256 with an EC leaf, same payload as [BLOB].
pub(crate) const BLOB_ES256: &str = include_str!("../test_data/blob-es256.jwt");

pub(crate) const ROOT_CRL_URL: &str = "http://crl.example.test/root.crl";
pub(crate) const INTERMEDIATE_CRL_URL: &str = "http://crl.example.test/intermediate.crl";

pub(crate) const ROOT_CRL: &[u8] = include_bytes!("../test_data/root.crl");
/// Lists the intermediate, serial 1A2B3C02.
pub(crate) const ROOT_REVOKED_CRL: &[u8] = include_bytes!("../test_data/root-revoked.crl");
/// Lists only serial 77.
pub(crate) const INTERMEDIATE_CRL: &[u8] = include_bytes!("../test_data/intermediate.crl");
/// Lists both leaves, serials 1A2B3C03 and 1A2B3C04.
pub(crate) const INTERMEDIATE_REVOKED_CRL: &[u8] =
    include_bytes!("../test_data/intermediate-revoked.crl");

pub(crate) const INTERMEDIATE_SERIAL: &str = "1A2B3C02";
pub(crate) const LEAF_SERIAL: &str = "1A2B3C03";

pub(crate) const FIDO2_AAGUID: &str = "d8522d9f-575b-4866-88a9-ba99fa02f35b";
pub(crate) const NESTED_FIDO2_AAGUID: &str = "0bb43545-fd2c-4185-87dd-feb0b2916ace";
pub(crate) const AMBIGUOUS_AAGUID: &str = "5ca1ab1e-1337-fee1-dead-beef00000001";
pub(crate) const UAF_AAID: &str = "4e4e#4005";
pub(crate) const U2F_AKI: &str = "bf7bcaa0d0c6187a8c6abbdd16a15640e7c7bde2";

pub(crate) const MDS_URL: &str = "https://mds.example.test/";
pub(crate) const ROOT_URL: &str = "http://pki.example.test/root.crt";

pub(crate) fn root() -> X509 {
    X509::from_pem(ROOT_PEM.as_bytes()).unwrap()
}

/// A fetcher serving revocation lists that revoke nothing in the chain.
pub(crate) fn clean_crls() -> StaticFetcher {
    StaticFetcher::new()
        .with(ROOT_CRL_URL, ROOT_CRL)
        .with(INTERMEDIATE_CRL_URL, INTERMEDIATE_CRL)
}

/// [clean_crls] plus the metadata blob and root certificate on their urls.
pub(crate) fn metadata_service(blob: &str) -> StaticFetcher {
    clean_crls()
        .with(MDS_URL, blob.as_bytes())
        .with(ROOT_URL, ROOT_DER)
}
