//! Decoding and verification of the signed metadata envelope, a compact JWS
//! whose header embeds the signing certificate chain in `x5c`.
//!
//! RS256 and ES256 envelopes are parsed and verified with `compact_jwt`. The
//! other RSA PKCS#1, RSA-PSS and ECDSA algorithms are checked with openssl.

use crate::chain::{display_name, CertificateChain, ChainVerifier, VerifiedChain};
use crate::error::{MdsError, Result};
use crate::fetch::Fetch;
use crate::trust::TrustRootStore;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use compact_jwt::crypto::{JwsEs256Verifier, JwsX509Verifier};
use compact_jwt::{Jws, JwsCompact, JwsVerifier, JwtError};
use openssl::bn::BigNum;
use openssl::ecdsa::EcdsaSig;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, PKeyRef, Public};
use openssl::rsa::Padding;
use openssl::sign::{RsaPssSaltlen, Verifier};
use openssl::x509::{X509Ref, X509};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, error, trace};

/// JWS signature algorithms accepted for the metadata envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwsAlgorithm {
    RS256,
    RS384,
    RS512,
    PS256,
    PS384,
    PS512,
    ES256,
    ES384,
    ES512,
}

impl FromStr for JwsAlgorithm {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RS256" => Ok(JwsAlgorithm::RS256),
            "RS384" => Ok(JwsAlgorithm::RS384),
            "RS512" => Ok(JwsAlgorithm::RS512),
            "PS256" => Ok(JwsAlgorithm::PS256),
            "PS384" => Ok(JwsAlgorithm::PS384),
            "PS512" => Ok(JwsAlgorithm::PS512),
            "ES256" => Ok(JwsAlgorithm::ES256),
            "ES384" => Ok(JwsAlgorithm::ES384),
            "ES512" => Ok(JwsAlgorithm::ES512),
            _ => Err(MdsError::Parse(format!("Unsupported JWS algorithm {s}."))),
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JwsAlgorithm::RS256 => "RS256",
            JwsAlgorithm::RS384 => "RS384",
            JwsAlgorithm::RS512 => "RS512",
            JwsAlgorithm::PS256 => "PS256",
            JwsAlgorithm::PS384 => "PS384",
            JwsAlgorithm::PS512 => "PS512",
            JwsAlgorithm::ES256 => "ES256",
            JwsAlgorithm::ES384 => "ES384",
            JwsAlgorithm::ES512 => "ES512",
        };
        write!(f, "{s}")
    }
}

impl JwsAlgorithm {
    fn digest(self) -> MessageDigest {
        match self {
            JwsAlgorithm::RS256 | JwsAlgorithm::PS256 | JwsAlgorithm::ES256 => {
                MessageDigest::sha256()
            }
            JwsAlgorithm::RS384 | JwsAlgorithm::PS384 | JwsAlgorithm::ES384 => {
                MessageDigest::sha384()
            }
            JwsAlgorithm::RS512 | JwsAlgorithm::PS512 | JwsAlgorithm::ES512 => {
                MessageDigest::sha512()
            }
        }
    }

    fn key_id(self) -> Id {
        match self {
            JwsAlgorithm::ES256 | JwsAlgorithm::ES384 | JwsAlgorithm::ES512 => Id::EC,
            _ => Id::RSA,
        }
    }

    fn curve(self) -> Option<Nid> {
        match self {
            JwsAlgorithm::ES256 => Some(Nid::X9_62_PRIME256V1),
            JwsAlgorithm::ES384 => Some(Nid::SECP384R1),
            JwsAlgorithm::ES512 => Some(Nid::SECP521R1),
            _ => None,
        }
    }

    fn is_pss(self) -> bool {
        matches!(
            self,
            JwsAlgorithm::PS256 | JwsAlgorithm::PS384 | JwsAlgorithm::PS512
        )
    }

    /// The algorithms `compact_jwt` understands.
    fn is_compact(self) -> bool {
        matches!(self, JwsAlgorithm::RS256 | JwsAlgorithm::ES256)
    }

    /// Byte length of each of `r` and `s` in a raw ECDSA signature.
    fn ec_coordinate_len(self) -> Option<usize> {
        match self {
            JwsAlgorithm::ES256 => Some(32),
            JwsAlgorithm::ES384 => Some(48),
            JwsAlgorithm::ES512 => Some(66),
            _ => None,
        }
    }

    /// Whether `key` has the type, and for ECDSA the curve, this algorithm names.
    pub fn accepts_key(self, key: &PKeyRef<Public>) -> bool {
        if key.id() != self.key_id() {
            return false;
        }
        match self.curve() {
            Some(nid) => key
                .ec_key()
                .map(|ec| ec.group().curve_name() == Some(nid))
                .unwrap_or(false),
            None => true,
        }
    }

    /// Verify `signature` over `input` with `key`. Mismatches of key type and
    /// malformed signatures verify as false.
    pub fn verify(self, key: &PKeyRef<Public>, input: &[u8], signature: &[u8]) -> Result<bool> {
        if !self.accepts_key(key) {
            error!(alg = %self, key = ?key.id(), "signing key does not match algorithm");
            return Ok(false);
        }

        let signature = match self.ec_coordinate_len() {
            Some(len) => match raw_ecdsa_to_der(signature, len) {
                Some(der) => der,
                None => return Ok(false),
            },
            None => signature.to_vec(),
        };

        let ossl = |e: openssl::error::ErrorStack| {
            error!(?e, "openssl error during signature verification");
            MdsError::SignatureVerification
        };

        let mut verifier = Verifier::new(self.digest(), key).map_err(ossl)?;
        if self.is_pss() {
            verifier.set_rsa_padding(Padding::PKCS1_PSS).map_err(ossl)?;
            verifier
                .set_rsa_pss_saltlen(RsaPssSaltlen::DIGEST_LENGTH)
                .map_err(ossl)?;
        }
        verifier.update(input).map_err(ossl)?;
        Ok(verifier.verify(&signature).unwrap_or(false))
    }
}

/// JWS carries ECDSA signatures as `r || s`; OpenSSL wants DER.
fn raw_ecdsa_to_der(signature: &[u8], coordinate_len: usize) -> Option<Vec<u8>> {
    if signature.len() != coordinate_len * 2 {
        return None;
    }
    let (r, s) = signature.split_at(coordinate_len);
    let r = BigNum::from_slice(r).ok()?;
    let s = BigNum::from_slice(s).ok()?;
    EcdsaSig::from_private_components(r, s)
        .and_then(|sig| sig.to_der())
        .ok()
}

/// A `compact_jwt` verifier bound to the envelope's signing certificate.
enum LeafVerifier {
    Rs256(JwsX509Verifier),
    Es256(JwsEs256Verifier),
}

impl LeafVerifier {
    fn new(alg: JwsAlgorithm, leaf: &X509Ref) -> std::result::Result<Self, JwtError> {
        match alg {
            JwsAlgorithm::ES256 => leaf
                .public_key()
                .and_then(|key| key.public_key_to_der())
                .map_err(|e| {
                    debug!(?e);
                    JwtError::OpenSSLError
                })
                .and_then(|der| JwsEs256Verifier::from_es256_der(&der))
                .map(LeafVerifier::Es256),
            _ => JwsX509Verifier::from_x509(leaf.to_owned()).map(LeafVerifier::Rs256),
        }
    }

    fn verify(&self, jws: &JwsCompact) -> std::result::Result<Jws, JwtError> {
        match self {
            LeafVerifier::Rs256(verifier) => verifier.verify(jws),
            LeafVerifier::Es256(verifier) => verifier.verify(jws),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct RawHeader {
    alg: String,
    #[serde(default)]
    x5c: Vec<String>,
    typ: Option<String>,
}

/// The decoded protected header of the envelope.
#[derive(Debug, Clone)]
pub struct JwsHeader {
    pub alg: JwsAlgorithm,
    /// Standard base64 DER certificates, leaf first.
    pub x5c: Vec<String>,
    pub typ: Option<String>,
}

impl JwsHeader {
    /// Parse the `x5c` certificates, leaf first.
    pub fn certificates(&self) -> Result<Vec<X509>> {
        if self.x5c.is_empty() {
            return Err(MdsError::ChainVerification(
                "No certificates were provided (x5c is empty).".to_string(),
            ));
        }
        self.x5c
            .iter()
            .enumerate()
            .map(|(idx, b64)| {
                let compact: String = b64.chars().filter(|c| !c.is_whitespace()).collect();
                STANDARD
                    .decode(compact)
                    .ok()
                    .and_then(|der| X509::from_der(&der).ok())
                    .ok_or_else(|| {
                        error!(idx, "unable to parse x5c certificate");
                        MdsError::ChainVerification(format!(
                            "Certificate {idx} in x5c cannot be parsed."
                        ))
                    })
            })
            .collect()
    }
}

/// A compact JWS split into its three segments. Nothing is verified yet.
#[derive(Debug, Clone, Copy)]
pub struct SignedEnvelope<'a> {
    token: &'a str,
    header: &'a str,
    payload: &'a str,
    signature: &'a str,
}

impl<'a> SignedEnvelope<'a> {
    pub fn parse(envelope: &'a str) -> Result<Self> {
        let token = envelope.trim();
        let mut parts = token.split('.');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(header), Some(payload), Some(signature), None)
                if !header.is_empty() && !payload.is_empty() && !signature.is_empty() =>
            {
                Ok(SignedEnvelope {
                    token,
                    header,
                    payload,
                    signature,
                })
            }
            _ => {
                error!("envelope does not have three non-empty segments");
                Err(MdsError::MalformedEnvelope)
            }
        }
    }

    pub fn header(&self) -> Result<JwsHeader> {
        let bytes = decode_segment(self.header, "header")?;
        let raw: RawHeader = serde_json::from_slice(&bytes).map_err(|err| {
            error!(?err, "unable to parse envelope header");
            MdsError::Parse("Envelope header is not valid JSON.".to_string())
        })?;
        Ok(JwsHeader {
            alg: JwsAlgorithm::from_str(&raw.alg)?,
            x5c: raw.x5c,
            typ: raw.typ,
        })
    }

    /// Parse the envelope as a `compact_jwt` token.
    pub fn compact(&self) -> Result<JwsCompact> {
        JwsCompact::from_str(self.token).map_err(|err| {
            error!(?err, "unable to parse compact envelope");
            MdsError::Parse("Envelope cannot be parsed as a compact JWS.".to_string())
        })
    }

    /// The bytes covered by the signature: `header.payload` as transmitted.
    pub fn signing_input(&self) -> String {
        format!("{}.{}", self.header, self.payload)
    }

    pub fn signature(&self) -> Result<Vec<u8>> {
        decode_segment(self.signature, "signature")
    }

    /// The payload as text. This does not check the signature.
    pub fn payload_unverified(&self) -> Result<String> {
        let bytes = decode_segment(self.payload, "payload")?;
        String::from_utf8(bytes)
            .map_err(|_| MdsError::Parse("Envelope payload is not valid utf-8.".to_string()))
    }
}

fn decode_segment(segment: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment.trim_end_matches('='))
        .map_err(|err| {
            error!(?err, %what, "invalid base64url segment");
            MdsError::Parse(format!("Envelope {what} is not valid base64url."))
        })
}

/// The leaf's key, provided it suits `alg`.
fn signing_key(alg: JwsAlgorithm, leaf: &X509Ref) -> Result<PKey<Public>> {
    let key = leaf.public_key().map_err(|err| {
        error!(?err, "unable to extract leaf key");
        MdsError::SignatureVerification
    })?;
    if !alg.accepts_key(&key) {
        error!(
            %alg,
            key = ?key.id(),
            signer = %display_name(leaf.subject_name()),
            "signing key does not match algorithm"
        );
        return Err(MdsError::SignatureVerification);
    }
    Ok(key)
}

/// Establishes trust in an envelope's signing chain and releases its payload.
pub struct EnvelopeDecoder<'a> {
    trust: &'a TrustRootStore,
    fetcher: &'a dyn Fetch,
}

impl<'a> EnvelopeDecoder<'a> {
    pub fn new(trust: &'a TrustRootStore, fetcher: &'a dyn Fetch) -> Self {
        EnvelopeDecoder { trust, fetcher }
    }

    /// Verify the envelope and return its payload text. The payload is only
    /// released once the chain is trusted, unrevoked, and the leaf's
    /// signature over the envelope is valid.
    pub fn verify_and_decode(&self, envelope: &str) -> Result<String> {
        self.verify(envelope).map(|(payload, _)| payload)
    }

    /// As [EnvelopeDecoder::verify_and_decode], also returning the verified chain.
    pub fn verify(&self, envelope: &str) -> Result<(String, VerifiedChain)> {
        let envelope = SignedEnvelope::parse(envelope)?;
        let header = envelope.header()?;
        trace!(alg = %header.alg, certs = header.x5c.len(), "envelope header");

        if header.alg.is_compact() {
            self.verify_compact(&envelope, header.alg)
        } else {
            self.verify_extended(&envelope, &header)
        }
    }

    fn trusted_chain(&self, certs: Vec<X509>) -> Result<VerifiedChain> {
        let trust_root = self.trust.resolve(self.fetcher)?;
        let chain = CertificateChain::new(certs, trust_root)?;
        ChainVerifier::new(self.fetcher).verify(chain)
    }

    fn verify_compact(
        &self,
        envelope: &SignedEnvelope<'_>,
        alg: JwsAlgorithm,
    ) -> Result<(String, VerifiedChain)> {
        let jws = envelope.compact()?;
        let certs = jws
            .get_x5c_chain()
            .map_err(|err| {
                error!(?err, "unable to parse x5c chain");
                MdsError::ChainVerification("Certificates in x5c cannot be parsed.".to_string())
            })?
            .unwrap_or_default();

        let verified = self.trusted_chain(certs)?;

        let leaf = verified.leaf();
        signing_key(alg, leaf)?;
        let released = LeafVerifier::new(alg, leaf)
            .and_then(|verifier| verifier.verify(&jws))
            .map_err(|err| {
                error!(?err, signer = %display_name(leaf.subject_name()), %alg, "envelope signature is invalid");
                MdsError::SignatureVerification
            })?;
        debug!(signer = %display_name(leaf.subject_name()), %alg, "envelope verified");

        let payload = String::from_utf8(released.payload().to_vec())
            .map_err(|_| MdsError::Parse("Envelope payload is not valid utf-8.".to_string()))?;
        Ok((payload, verified))
    }

    fn verify_extended(
        &self,
        envelope: &SignedEnvelope<'_>,
        header: &JwsHeader,
    ) -> Result<(String, VerifiedChain)> {
        let verified = self.trusted_chain(header.certificates()?)?;

        let leaf = verified.leaf();
        let key = signing_key(header.alg, leaf)?;
        let signature = envelope.signature()?;
        if !header
            .alg
            .verify(&key, envelope.signing_input().as_bytes(), &signature)?
        {
            error!(signer = %display_name(leaf.subject_name()), alg = %header.alg, "envelope signature is invalid");
            return Err(MdsError::SignatureVerification);
        }
        debug!(signer = %display_name(leaf.subject_name()), alg = %header.alg, "envelope verified");

        let payload = envelope.payload_unverified()?;
        Ok((payload, verified))
    }
}
