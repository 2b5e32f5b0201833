//! Client configuration. Defaults come from `config/default.json`, which is
//! compiled into the crate, and may be overridden through [ConfigOptions] or
//! the setters of [ClientConfigBuilder].

use crate::client::MdsClient;
use crate::error::{MdsError, Result};
use crate::fetch::{Fetch, HttpFetcher};
use crate::trust::DefaultRoot;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use url::Url;

static BUNDLED_CONFIG: &str = include_str!("../config/default.json");

/// Where the signed metadata blob is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdsAccess {
    Url,
    File,
    Jwt,
}

impl FromStr for MdsAccess {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "url" => Ok(MdsAccess::Url),
            "file" => Ok(MdsAccess::File),
            "jwt" => Ok(MdsAccess::Jwt),
            _ => Err(MdsError::Setting(format!(
                "Please set how to access MDS. Unknown access {s}."
            ))),
        }
    }
}

impl fmt::Display for MdsAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MdsAccess::Url => write!(f, "url"),
            MdsAccess::File => write!(f, "file"),
            MdsAccess::Jwt => write!(f, "jwt"),
        }
    }
}

/// Where the trust root certificate is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootAccess {
    Url,
    File,
    Pem,
}

impl FromStr for RootAccess {
    type Err = MdsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "url" => Ok(RootAccess::Url),
            "file" => Ok(RootAccess::File),
            "pem" => Ok(RootAccess::Pem),
            _ => Err(MdsError::Setting(format!(
                "Please set how to access root certificate. Unknown access {s}."
            ))),
        }
    }
}

impl fmt::Display for RootAccess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootAccess::Url => write!(f, "url"),
            RootAccess::File => write!(f, "file"),
            RootAccess::Pem => write!(f, "pem"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundledMds {
    pub url: Url,
    pub file: PathBuf,
    pub access: MdsAccess,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundledRoot {
    pub url: Url,
    pub file: PathBuf,
    pub access: RootAccess,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BundledPayload {
    pub file: Option<PathBuf>,
}

/// The defaults compiled into the crate.
#[derive(Debug, Clone, Deserialize)]
pub struct BundledConfig {
    pub mds: BundledMds,
    pub root: BundledRoot,
    pub payload: BundledPayload,
}

impl BundledConfig {
    pub fn load() -> Result<Self> {
        serde_json::from_str(BUNDLED_CONFIG).map_err(|e| {
            MdsError::Setting(format!("Bundled configuration is invalid: {e}"))
        })
    }
}

/// Optional overrides of the bundled defaults, as accepted from a caller's
/// own configuration. Unset and empty values fall back to the defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOptions {
    pub mds_url: Option<Url>,
    pub mds_file: Option<PathBuf>,
    pub mds_jwt: Option<String>,
    pub payload_file: Option<PathBuf>,
    pub root_url: Option<Url>,
    pub root_file: Option<PathBuf>,
    pub root_pem: Option<String>,
    pub access_mds: Option<String>,
    pub access_root_certificate: Option<String>,
}

fn non_empty_str(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.is_empty())
}

fn non_empty_path(v: Option<PathBuf>) -> Option<PathBuf> {
    v.filter(|p| !p.as_os_str().is_empty())
}

/// Picks the access mode when exactly one of the three sources is given.
fn infer<T>(sources: [bool; 3], modes: [T; 3]) -> Option<T> {
    match sources {
        [true, false, false] | [false, true, false] | [false, false, true] => sources
            .iter()
            .zip(modes)
            .find_map(|(set, mode)| set.then_some(mode)),
        _ => None,
    }
}

/// A complete, immutable client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    mds_url: Url,
    mds_file: PathBuf,
    mds_jwt: Option<String>,
    payload_file: Option<PathBuf>,
    root_url: Url,
    root_file: PathBuf,
    root_pem: Option<String>,
    access_mds: MdsAccess,
    access_root_certificate: RootAccess,
    default_root: DefaultRoot,
}

impl ClientConfig {
    pub fn mds_url(&self) -> &Url {
        &self.mds_url
    }

    pub fn mds_file(&self) -> &Path {
        &self.mds_file
    }

    pub fn mds_jwt(&self) -> Option<&str> {
        self.mds_jwt.as_deref()
    }

    /// Where the verified payload text is written after each load, if anywhere.
    pub fn payload_file(&self) -> Option<&Path> {
        self.payload_file.as_deref()
    }

    pub fn root_url(&self) -> &Url {
        &self.root_url
    }

    pub fn root_file(&self) -> &Path {
        &self.root_file
    }

    pub fn root_pem(&self) -> Option<&str> {
        self.root_pem.as_deref()
    }

    pub fn access_mds(&self) -> MdsAccess {
        self.access_mds
    }

    pub fn access_root_certificate(&self) -> RootAccess {
        self.access_root_certificate
    }

    /// The root used when none has been explicitly set, and where it is cached.
    pub fn default_root(&self) -> &DefaultRoot {
        &self.default_root
    }
}

/// Builds a [ClientConfig], and from it an [MdsClient].
///
/// ```no_run
/// use fido_mds3::ClientConfigBuilder;
///
/// # fn main() -> Result<(), fido_mds3::MdsError> {
/// let client = ClientConfigBuilder::new()?
///     .mds_file("blob.jwt")?
///     .root_file("root-r3.crt")?
///     .build_loaded()?;
/// let entry = client.find_by_aaguid("ee882879-721c-4913-9775-3dfcce97072a", false)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Start from the bundled defaults.
    pub fn new() -> Result<Self> {
        Self::from_options(ConfigOptions::default())
    }

    /// Start from the bundled defaults overridden by `options`. When no access
    /// mode is given and exactly one source is set, that source's mode is used.
    pub fn from_options(options: ConfigOptions) -> Result<Self> {
        let bundled = BundledConfig::load()?;

        let mds_file = non_empty_path(options.mds_file);
        let mds_jwt = non_empty_str(options.mds_jwt);
        let root_file = non_empty_path(options.root_file);
        let root_pem = non_empty_str(options.root_pem);

        let access_mds = match non_empty_str(options.access_mds) {
            Some(access) => MdsAccess::from_str(&access)?,
            None => infer(
                [
                    options.mds_url.is_some(),
                    mds_file.is_some(),
                    mds_jwt.is_some(),
                ],
                [MdsAccess::Url, MdsAccess::File, MdsAccess::Jwt],
            )
            .unwrap_or(bundled.mds.access),
        };

        let access_root_certificate = match non_empty_str(options.access_root_certificate) {
            Some(access) => RootAccess::from_str(&access)?,
            None => infer(
                [
                    options.root_url.is_some(),
                    root_file.is_some(),
                    root_pem.is_some(),
                ],
                [RootAccess::Url, RootAccess::File, RootAccess::Pem],
            )
            .unwrap_or(bundled.root.access),
        };

        let default_root = DefaultRoot {
            url: bundled.root.url.clone(),
            cache_file: bundled.root.file.clone(),
        };

        let config = ClientConfig {
            mds_url: options.mds_url.unwrap_or(bundled.mds.url),
            mds_file: mds_file.unwrap_or(bundled.mds.file),
            mds_jwt,
            payload_file: non_empty_path(options.payload_file).or(bundled.payload.file),
            root_url: options.root_url.unwrap_or(bundled.root.url),
            root_file: root_file.unwrap_or(bundled.root.file),
            root_pem,
            access_mds,
            access_root_certificate,
            default_root,
        };
        debug!(
            access_mds = %config.access_mds,
            access_root_certificate = %config.access_root_certificate,
            "client configuration"
        );
        Ok(ClientConfigBuilder { config })
    }

    pub fn mds_url(mut self, url: &str) -> Result<Self> {
        self.config.mds_url = parse_url("mdsUrl", url)?;
        self.config.access_mds = MdsAccess::Url;
        Ok(self)
    }

    pub fn mds_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config.mds_file = require_path("mdsFile", path.as_ref())?;
        self.config.access_mds = MdsAccess::File;
        Ok(self)
    }

    pub fn mds_jwt(mut self, jwt: &str) -> Result<Self> {
        self.config.mds_jwt = Some(require_str("mdsJwt", jwt)?);
        self.config.access_mds = MdsAccess::Jwt;
        Ok(self)
    }

    /// Deprecated: the payload is also retained in memory, see
    /// [crate::MetadataSnapshot::payload_text].
    pub fn payload_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config.payload_file = Some(require_path("payloadFile", path.as_ref())?);
        Ok(self)
    }

    pub fn root_url(mut self, url: &str) -> Result<Self> {
        self.config.root_url = parse_url("rootUrl", url)?;
        self.config.access_root_certificate = RootAccess::Url;
        Ok(self)
    }

    pub fn root_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config.root_file = require_path("rootFile", path.as_ref())?;
        self.config.access_root_certificate = RootAccess::File;
        Ok(self)
    }

    pub fn root_pem(mut self, pem: &str) -> Result<Self> {
        self.config.root_pem = Some(require_str("rootPem", pem)?);
        self.config.access_root_certificate = RootAccess::Pem;
        Ok(self)
    }

    pub fn access_mds(mut self, access: &str) -> Result<Self> {
        self.config.access_mds = MdsAccess::from_str(require_str("accessMds", access)?.as_str())?;
        Ok(self)
    }

    pub fn access_root_certificate(mut self, access: &str) -> Result<Self> {
        self.config.access_root_certificate =
            RootAccess::from_str(require_str("accessRootCertificate", access)?.as_str())?;
        Ok(self)
    }

    /// Where a default root fetched from its url is cached.
    pub fn default_root_cache_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.config.default_root.cache_file = require_path("defaultRootCacheFile", path.as_ref())?;
        Ok(self)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn into_config(self) -> ClientConfig {
        self.config
    }

    /// A client that has not loaded any metadata yet.
    pub fn build(self) -> Result<MdsClient> {
        let fetcher = HttpFetcher::new()?;
        Ok(self.build_with_fetcher(Arc::new(fetcher)))
    }

    pub fn build_with_fetcher(self, fetcher: Arc<dyn Fetch>) -> MdsClient {
        MdsClient::with_fetcher(self.config, fetcher)
    }

    /// A client that has already performed its first load.
    pub fn build_loaded(self) -> Result<MdsClient> {
        let client = self.build()?;
        client.refresh()?;
        Ok(client)
    }
}

fn require_str(name: &str, value: &str) -> Result<String> {
    if value.is_empty() {
        Err(MdsError::InvalidParameter(format!("\"{name}\" is empty.")))
    } else {
        Ok(value.to_string())
    }
}

fn require_path(name: &str, value: &Path) -> Result<PathBuf> {
    if value.as_os_str().is_empty() {
        Err(MdsError::InvalidParameter(format!("\"{name}\" is empty.")))
    } else {
        Ok(value.to_path_buf())
    }
}

fn parse_url(name: &str, value: &str) -> Result<Url> {
    let value = require_str(name, value)?;
    Url::parse(&value)
        .map_err(|e| MdsError::InvalidParameter(format!("\"{name}\" is not a valid url: {e}")))
}
