//! Certificate chain trust and revocation checking.
//!
//! The chain is ordered leaf first, and always ends with the trust root. Each
//! certificate must be signed by the key of the certificate that follows it,
//! and no certificate in the chain may be listed by any of the revocation
//! lists that the chain's certificates point to.

use crate::error::{MdsError, Result};
use crate::fetch::Fetch;
use crate::trust::is_pem;
use openssl::x509::{X509Crl, X509NameRef, X509Ref, X509};
use std::collections::BTreeSet;
use tracing::{debug, error, trace};
use url::Url;

/// An ordered chain of certificates: `[leaf, intermediate..., root]`.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    certs: Vec<X509>,
}

impl CertificateChain {
    /// Build a chain from the embedded certificates (leaf first) and append
    /// the trust root.
    pub fn new(mut certs: Vec<X509>, trust_root: X509) -> Result<Self> {
        if certs.is_empty() {
            return Err(MdsError::ChainVerification(
                "No certificates were provided (x5c is empty).".to_string(),
            ));
        }
        certs.push(trust_root);
        Ok(CertificateChain { certs })
    }

    pub fn leaf(&self) -> &X509Ref {
        // Non empty by construction.
        &self.certs[0]
    }

    pub fn trust_root(&self) -> &X509Ref {
        &self.certs[self.certs.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &X509Ref> {
        self.certs.iter().map(|c| &**c)
    }

    /// The certificates that were embedded in the envelope, excluding the root.
    pub fn embedded(&self) -> impl Iterator<Item = &X509Ref> {
        self.certs[..self.certs.len() - 1].iter().map(|c| &**c)
    }
}

/// Serial numbers, as upper case hex, collected from revocation lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevocationSet {
    serials: BTreeSet<String>,
}

impl RevocationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch every CRL distribution point named by the embedded certificates
    /// of `chain` and collect their revoked serials. Each list must be signed
    /// by the issuer of the certificate that named it.
    pub fn from_chain(chain: &CertificateChain, fetcher: &dyn Fetch) -> Result<Self> {
        let mut set = RevocationSet::new();
        for (cert, issuer) in chain.embedded().zip(chain.iter().skip(1)) {
            for url in crl_distribution_points(cert) {
                debug!(%url, subject = %display_name(cert.subject_name()), "fetching crl");
                let crl = fetcher.fetch(&url)?;
                set.insert_crl(&crl, issuer)?;
            }
        }
        Ok(set)
    }

    /// Add every serial revoked by a DER (or PEM) encoded CRL issued by `issuer`.
    pub fn insert_crl(&mut self, crl: &[u8], issuer: &X509Ref) -> Result<()> {
        let crl = if is_pem(crl) {
            X509Crl::from_pem(crl)
        } else {
            X509Crl::from_der(crl)
        }
        .map_err(|err| {
            error!(?err, "unable to parse crl");
            MdsError::ChainVerification("Revocation list cannot be parsed.".to_string())
        })?;

        let issuer_name = display_name(issuer.subject_name());
        let signed = issuer
            .public_key()
            .and_then(|key| crl.verify(&key))
            .map_err(|err| {
                error!(?err, issuer = %issuer_name, "unable to check crl signature");
                MdsError::ChainVerification(
                    "Revocation list signature cannot be checked.".to_string(),
                )
            })?;
        if !signed {
            error!(
                crl_issuer = %display_name(crl.issuer_name()),
                issuer = %issuer_name,
                "crl is not signed by the certificate issuer"
            );
            return Err(MdsError::ChainVerification(format!(
                "Revocation list is not signed by {issuer_name}."
            )));
        }

        if let Some(revoked) = crl.get_revoked() {
            for entry in revoked {
                let serial = entry
                    .serial_number()
                    .to_bn()
                    .and_then(|bn| bn.to_hex_str().map(|s| s.to_ascii_uppercase()))
                    .map_err(|e| MdsError::ChainVerification(e.to_string()))?;
                trace!(%serial, "revoked");
                self.serials.insert(serial);
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, serial: &str) {
        self.serials.insert(serial.to_ascii_uppercase());
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.serials.contains(&serial.to_ascii_uppercase())
    }

    pub fn len(&self) -> usize {
        self.serials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serials.is_empty()
    }
}

/// One validated link of the chain: `subject` was signed by the next
/// certificate's key using `signature_algorithm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainLink {
    pub subject: String,
    pub serial: String,
    pub signature_algorithm: String,
    pub signature_hex: String,
}

/// A chain that has passed revocation and signature checks.
#[derive(Debug, Clone)]
pub struct VerifiedChain {
    chain: CertificateChain,
    links: Vec<ChainLink>,
}

impl VerifiedChain {
    /// The certificate whose key signs the envelope.
    pub fn leaf(&self) -> &X509Ref {
        self.chain.leaf()
    }

    pub fn chain(&self) -> &CertificateChain {
        &self.chain
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }
}

pub struct ChainVerifier<'a> {
    fetcher: &'a dyn Fetch,
}

impl<'a> ChainVerifier<'a> {
    pub fn new(fetcher: &'a dyn Fetch) -> Self {
        ChainVerifier { fetcher }
    }

    pub fn verify(&self, chain: CertificateChain) -> Result<VerifiedChain> {
        let revoked = RevocationSet::from_chain(&chain, self.fetcher)?;
        verify_chain(chain, &revoked)
    }
}

/// Check `chain` against an already gathered revocation set, then verify each
/// link. The first failing link fails the chain.
pub fn verify_chain(chain: CertificateChain, revoked: &RevocationSet) -> Result<VerifiedChain> {
    for cert in chain.iter() {
        let serial = serial_hex(cert)?;
        if revoked.contains(&serial) {
            error!(%serial, subject = %display_name(cert.subject_name()), "certificate is revoked");
            return Err(MdsError::RevokedCertificate { serial });
        }
    }

    let mut links = Vec::with_capacity(chain.len() - 1);
    for pair in chain.certs.windows(2) {
        let (cert, issuer) = (&pair[0], &pair[1]);
        let subject = display_name(cert.subject_name());

        let issuer_key = issuer.public_key().map_err(|err| {
            error!(?err, issuer = %display_name(issuer.subject_name()), "unable to extract issuer key");
            MdsError::ChainVerification(format!("Unable to extract the key that signed {subject}."))
        })?;

        match cert.verify(&issuer_key) {
            Ok(true) => {}
            Ok(false) => {
                error!(%subject, issuer = %display_name(issuer.subject_name()), "signature does not verify");
                return Err(MdsError::ChainVerification(format!(
                    "Signature of {subject} does not verify."
                )));
            }
            Err(err) => {
                error!(?err, %subject, "unable to verify signature");
                return Err(MdsError::ChainVerification(format!(
                    "Signature of {subject} cannot be checked."
                )));
            }
        }

        links.push(ChainLink {
            serial: serial_hex(cert)?,
            signature_algorithm: cert.signature_algorithm().object().to_string(),
            signature_hex: hex::encode(cert.signature().as_slice()),
            subject,
        });
    }

    debug!(links = links.len(), "certificate chain verified");
    Ok(VerifiedChain { chain, links })
}

/// The URIs of every CRL distribution point in `cert`.
pub fn crl_distribution_points(cert: &X509Ref) -> Vec<Url> {
    let Some(points) = cert.crl_distribution_points() else {
        return Vec::new();
    };

    points
        .iter()
        .filter_map(|dp| dp.distpoint())
        .filter_map(|name| name.fullname())
        .flat_map(|names| names.iter())
        .filter_map(|gn| gn.uri())
        .filter_map(|uri| match Url::parse(uri) {
            Ok(url) => Some(url),
            Err(err) => {
                error!(?err, %uri, "ignoring invalid crl distribution point");
                None
            }
        })
        .collect()
}

pub(crate) fn serial_hex(cert: &X509Ref) -> Result<String> {
    cert.serial_number()
        .to_bn()
        .and_then(|bn| bn.to_hex_str().map(|s| s.to_ascii_uppercase()))
        .map_err(|e| MdsError::ChainVerification(e.to_string()))
}

/// Render a name as `O=..., CN=...` for logging.
pub(crate) fn display_name(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry.object().nid().short_name().unwrap_or("?");
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::fetch::testutil::StaticFetcher;
    use crate::fixtures::*;
    use base64::{engine::general_purpose::STANDARD, engine::general_purpose::URL_SAFE_NO_PAD, Engine};

    /// The `x5c` certificates embedded in a fixture blob.
    fn embedded_certs(blob: &str) -> Vec<X509> {
        let header = blob.split('.').next().unwrap();
        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header).unwrap()).unwrap();
        header["x5c"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| X509::from_der(&STANDARD.decode(c.as_str().unwrap()).unwrap()).unwrap())
            .collect()
    }

    fn fixture_chain() -> CertificateChain {
        CertificateChain::new(embedded_certs(BLOB), root()).unwrap()
    }

    #[test]
    fn empty_chain_is_rejected() {
        let err = CertificateChain::new(Vec::new(), root()).unwrap_err();
        assert!(matches!(err, MdsError::ChainVerification(_)));
    }

    #[test]
    fn distribution_points_are_extracted() {
        let chain = fixture_chain();
        let points: Vec<Vec<String>> = chain
            .iter()
            .map(|c| {
                crl_distribution_points(c)
                    .into_iter()
                    .map(|u| u.to_string())
                    .collect()
            })
            .collect();
        assert_eq!(
            points,
            vec![
                vec![INTERMEDIATE_CRL_URL.to_string()],
                vec![ROOT_CRL_URL.to_string()],
                vec![],
            ]
        );
    }

    #[test]
    fn valid_chain_verifies() {
        let fetcher = clean_crls();
        let verified = ChainVerifier::new(&fetcher)
            .verify(fixture_chain())
            .unwrap();
        assert_eq!(verified.links().len(), 2);
        assert_eq!(verified.links()[0].serial, LEAF_SERIAL);
        assert_eq!(verified.links()[1].serial, INTERMEDIATE_SERIAL);
        assert_eq!(
            verified.links()[0].signature_algorithm,
            "sha256WithRSAEncryption"
        );
        assert_eq!(fetcher.hits(ROOT_CRL_URL), 1);
        assert_eq!(fetcher.hits(INTERMEDIATE_CRL_URL), 1);
    }

    #[test]
    fn single_certificate_chain_verifies() {
        // Only the intermediate, which the root signed directly.
        let intermediate = embedded_certs(BLOB).remove(1);
        let chain = CertificateChain::new(vec![intermediate], root()).unwrap();
        let verified = verify_chain(chain, &RevocationSet::new()).unwrap();
        assert_eq!(verified.links().len(), 1);
    }

    #[test]
    fn flipped_signature_byte_fails_chain() {
        for idx in 0..2 {
            let mut certs = embedded_certs(BLOB);
            let mut der = certs[idx].to_der().unwrap();
            // The signature bit string is the tail of the certificate.
            let last = der.len() - 1;
            der[last] ^= 0x01;
            certs[idx] = X509::from_der(&der).unwrap();

            let chain = CertificateChain::new(certs, root()).unwrap();
            let err = verify_chain(chain, &RevocationSet::new()).unwrap_err();
            assert!(matches!(err, MdsError::ChainVerification(_)), "{idx}");
        }
    }

    #[test]
    fn wrong_root_fails_chain() {
        let other = X509::from_der(EXPIRED_ROOT_DER).unwrap();
        let chain = CertificateChain::new(embedded_certs(BLOB), other).unwrap();
        let err = verify_chain(chain, &RevocationSet::new()).unwrap_err();
        assert!(matches!(err, MdsError::ChainVerification(_)));
    }

    #[test]
    fn revoked_leaf_is_detected() {
        let fetcher = clean_crls().with(INTERMEDIATE_CRL_URL, INTERMEDIATE_REVOKED_CRL);
        let err = ChainVerifier::new(&fetcher)
            .verify(fixture_chain())
            .unwrap_err();
        match err {
            MdsError::RevokedCertificate { serial } => assert_eq!(serial, LEAF_SERIAL),
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn revoked_intermediate_is_detected() {
        let fetcher = clean_crls().with(ROOT_CRL_URL, ROOT_REVOKED_CRL);
        let err = ChainVerifier::new(&fetcher)
            .verify(fixture_chain())
            .unwrap_err();
        match err {
            MdsError::RevokedCertificate { serial } => assert_eq!(serial, INTERMEDIATE_SERIAL),
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn revoked_root_is_detected() {
        let mut revoked = RevocationSet::new();
        revoked.insert(&serial_hex(&root()).unwrap().to_ascii_lowercase());
        let err = verify_chain(fixture_chain(), &revoked).unwrap_err();
        assert!(matches!(err, MdsError::RevokedCertificate { .. }));
    }

    #[test]
    fn unreachable_crl_is_an_access_error() {
        let fetcher = StaticFetcher::new().with(ROOT_CRL_URL, ROOT_CRL);
        let err = ChainVerifier::new(&fetcher)
            .verify(fixture_chain())
            .unwrap_err();
        assert!(matches!(err, MdsError::Access(_)));
    }

    #[test]
    fn crl_serials_are_collected() {
        let intermediate = embedded_certs(BLOB).remove(1);
        let mut set = RevocationSet::new();
        set.insert_crl(INTERMEDIATE_REVOKED_CRL, &intermediate).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.contains("1a2b3c03"));
        assert!(set.contains("1A2B3C04"));

        assert!(matches!(
            set.insert_crl(b"not a crl", &intermediate),
            Err(MdsError::ChainVerification(_))
        ));
    }

    #[test]
    fn crl_from_another_issuer_is_rejected() {
        let intermediate = embedded_certs(BLOB).remove(1);
        let mut set = RevocationSet::new();
        let err = set.insert_crl(ROOT_CRL, &intermediate).unwrap_err();
        assert!(matches!(err, MdsError::ChainVerification(_)));
        assert!(set.is_empty());

        // A list served at the leaf's distribution point but signed by the
        // root cannot stand in for the intermediate's list.
        let fetcher = clean_crls().with(INTERMEDIATE_CRL_URL, ROOT_CRL);
        let err = ChainVerifier::new(&fetcher)
            .verify(fixture_chain())
            .unwrap_err();
        assert!(matches!(err, MdsError::ChainVerification(_)));
    }
}
