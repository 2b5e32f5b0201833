//! The root of trust that metadata blob signing chains must terminate in.
//!
//! A [TrustRootStore] holds at most one root certificate. It can be set
//! explicitly from a PEM string, a DER (or PEM) file, or a url. When nothing
//! has been set, [TrustRootStore::resolve] falls back to the default root:
//! a locally cached copy if one exists, else the root compiled into this
//! crate, as long as it is inside its validity window. Otherwise the default
//! root is downloaded and the local cache refreshed.

use crate::chain::display_name;
use crate::error::{MdsError, Result};
use crate::fetch::Fetch;
use openssl::asn1::Asn1Time;
use openssl::x509::{X509Ref, X509};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

// The root that signs the FIDO Alliance metadata service blob.
static GLOBAL_SIGN_ROOT_CA_R3: &str = r#"
-----BEGIN CERTIFICATE-----
MIIDXzCCAkegAwIBAgILBAAAAAABIVhTCKIwDQYJKoZIhvcNAQELBQAwTDEgMB4G
A1UECxMXR2xvYmFsU2lnbiBSb290IENBIC0gUjMxEzARBgNVBAoTCkdsb2JhbFNp
Z24xEzARBgNVBAMTCkdsb2JhbFNpZ24wHhcNMDkwMzE4MTAwMDAwWhcNMjkwMzE4
MTAwMDAwWjBMMSAwHgYDVQQLExdHbG9iYWxTaWduIFJvb3QgQ0EgLSBSMzETMBEG
A1UEChMKR2xvYmFsU2lnbjETMBEGA1UEAxMKR2xvYmFsU2lnbjCCASIwDQYJKoZI
hvcNAQEBBQADggEPADCCAQoCggEBAMwldpB5BngiFvXAg7aEyiie/QV2EcWtiHL8
RgJDx7KKnQRfJMsuS+FggkbhUqsMgUdwbN1k0ev1LKMPgj0MK66X17YUhhB5uzsT
gHeMCOFJ0mpiLx9e+pZo34knlTifBtc+ycsmWQ1z3rDI6SYOgxXG71uL0gRgykmm
KPZpO/bLyCiR5Z2KYVc3rHQU3HTgOu5yLy6c+9C7v/U9AOEGM+iCK65TpjoWc4zd
QQ4gOsC0p6Hpsk+QLjJg6VfLuQSSaGjlOCZgdbKfd/+RFO+uIEn8rUAVSNECMWEZ
XriX7613t2Saer9fwRPvm2L7DWzgVGkWqQPabumDk3F2xmmFghcCAwEAAaNCMEAw
DgYDVR0PAQH/BAQDAgEGMA8GA1UdEwEB/wQFMAMBAf8wHQYDVR0OBBYEFI/wS3+o
LkUkrk1Q+mOai97i3Ru8MA0GCSqGSIb3DQEBCwUAA4IBAQBLQNvAUKr+yAzv95ZU
RUm7lgAJQayzE4aGKAczymvmdLm6AC2upArT9fHxD4q/c2dKg8dEe3jgr25sbwMp
jjM5RcOO5LlXbKr8EpbsU8Yt5CRsuZRj+9xTaGdWPoO4zzUhw8lo/s7awlOqzJCK
6fBdRoyV3XpYKBovHd7NADdBj+1EbddTKJd+82cEHhXXipa0095MJ6RMG3NzdvQX
mcIfeg7jLQitChws/zyrVQ4PkX4268NXSb7hLi18YIvDQVETI53O9zJrlAGomecs
Mx86OyXShkDOOyyGeMlhLxS67ttVb9+E7gUJTb0o2HLO02JQZR7rkpeDMdmztcpH
WD9f
-----END CERTIFICATE-----
"#;

/// Where the default root is downloaded from, and where the downloaded copy
/// is kept between runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultRoot {
    pub url: Url,
    pub cache_file: PathBuf,
}

#[derive(Debug)]
pub struct TrustRootStore {
    root: RwLock<Option<X509>>,
    default_root: DefaultRoot,
}

impl TrustRootStore {
    pub fn new(default_root: DefaultRoot) -> Self {
        TrustRootStore {
            root: RwLock::new(None),
            default_root,
        }
    }

    pub fn default_root(&self) -> &DefaultRoot {
        &self.default_root
    }

    /// Set the trust root from a PEM encoded certificate.
    pub fn set_from_pem(&self, pem: &str) -> Result<()> {
        let cert = X509::from_pem(pem.as_bytes()).map_err(|err| {
            error!(?err, "unable to parse root certificate pem");
            MdsError::Parse("Root certificate PEM cannot be parsed.".to_string())
        })?;
        self.install(cert);
        Ok(())
    }

    /// Set the trust root from a certificate file. The file is expected to be
    /// DER, but PEM is accepted too.
    pub fn set_from_file(&self, path: &Path) -> Result<()> {
        let bytes = fs::read(path).map_err(|err| {
            error!(?err, ?path, "unable to read root certificate");
            MdsError::Access(format!("Unable to read {}: {err}", path.display()))
        })?;
        let cert = parse_certificate(&bytes)?;
        self.install(cert);
        Ok(())
    }

    /// Download the trust root from `url`.
    pub fn set_from_url(&self, url: &Url, fetcher: &dyn Fetch) -> Result<()> {
        let bytes = fetcher.fetch(url)?;
        let cert = parse_certificate(&bytes)?;
        self.install(cert);
        Ok(())
    }

    /// Forget the configured root. The next [TrustRootStore::resolve] will use
    /// the default root.
    pub fn detach(&self) {
        debug!("detaching trust root");
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The explicitly configured root, if any.
    pub fn current(&self) -> Option<X509> {
        self.root
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The explicitly configured root, or the default root if none is set.
    pub fn resolve(&self, fetcher: &dyn Fetch) -> Result<X509> {
        match self.current() {
            Some(cert) => Ok(cert),
            None => self.resolve_default(fetcher),
        }
    }

    /// Select the default root. This does not install it as the configured
    /// root, so it is reconsidered on every call.
    pub fn resolve_default(&self, fetcher: &dyn Fetch) -> Result<X509> {
        let cache_file = &self.default_root.cache_file;

        let candidate = match fs::read(cache_file) {
            Ok(bytes) => match parse_certificate(&bytes) {
                Ok(cert) => Some(cert),
                Err(err) => {
                    warn!(?err, ?cache_file, "ignoring unparsable cached root");
                    None
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                warn!(?err, ?cache_file, "ignoring unreadable cached root");
                None
            }
        }
        .or_else(|| X509::from_pem(GLOBAL_SIGN_ROOT_CA_R3.as_bytes()).ok());

        if let Some(cert) = candidate {
            if is_within_validity(&cert)? {
                debug!(subject = %display_name(cert.subject_name()), "using bundled root");
                return Ok(cert);
            }
            warn!(subject = %display_name(cert.subject_name()), "bundled root is outside its validity window");
        }

        let url = &self.default_root.url;
        info!(%url, "downloading default root");
        let bytes = fetcher.fetch(url)?;
        let cert = parse_certificate(&bytes)?;

        if let Some(parent) = cache_file.parent() {
            if !parent.as_os_str().is_empty() {
                if let Err(err) = fs::create_dir_all(parent) {
                    warn!(?err, ?parent, "unable to create root cache directory");
                }
            }
        }
        match cert.to_der() {
            Ok(der) => {
                if let Err(err) = fs::write(cache_file, der) {
                    warn!(?err, ?cache_file, "unable to persist default root");
                }
            }
            Err(err) => warn!(?err, "unable to encode default root"),
        }

        Ok(cert)
    }

    fn install(&self, cert: X509) {
        debug!(subject = %display_name(cert.subject_name()), "trust root set");
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = Some(cert);
    }
}

/// Parse a certificate that may be DER or PEM.
pub(crate) fn parse_certificate(bytes: &[u8]) -> Result<X509> {
    let parsed = if is_pem(bytes) {
        X509::from_pem(bytes)
    } else {
        X509::from_der(bytes)
    };
    parsed.map_err(|err| {
        error!(?err, "unable to parse certificate");
        MdsError::Parse("Certificate cannot be parsed.".to_string())
    })
}

pub(crate) fn is_pem(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .map(|start| bytes[start..].starts_with(b"-----BEGIN"))
        .unwrap_or(false)
}

/// True when now falls within `[notBefore, notAfter]`.
pub(crate) fn is_within_validity(cert: &X509Ref) -> Result<bool> {
    let now = Asn1Time::days_from_now(0).map_err(|e| MdsError::Parse(e.to_string()))?;
    let started = cert
        .not_before()
        .compare(&now)
        .map_err(|e| MdsError::Parse(e.to_string()))?
        != Ordering::Greater;
    let not_expired = cert
        .not_after()
        .compare(&now)
        .map_err(|e| MdsError::Parse(e.to_string()))?
        != Ordering::Less;
    Ok(started && not_expired)
}
