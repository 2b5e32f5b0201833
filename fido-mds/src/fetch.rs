//! Retrieval of remote resources (the metadata blob, root certificates and
//! revocation lists). Everything in this crate that touches the network does
//! so through the [Fetch] trait so that it can be substituted in tests.

use crate::error::{MdsError, Result};
use tracing::{debug, error};
use url::Url;

/// Retrieve the bytes found at a url. Implementations make a single attempt
/// and must report a non-success status as [MdsError::Access].
pub trait Fetch: Send + Sync {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>>;

    /// Fetch a resource that is expected to be UTF-8 text.
    fn fetch_text(&self, url: &Url) -> Result<String> {
        let bytes = self.fetch(url)?;
        String::from_utf8(bytes)
            .map_err(|_| MdsError::Access(format!("Response from {url} is not valid utf-8.")))
    }
}

/// A blocking HTTP fetcher.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("fido-mds3/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MdsError::Access(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
        debug!(%url, "fetching");
        let response = self.client.get(url.clone()).send().map_err(|err| {
            error!(?err, %url, "request failed");
            MdsError::Access(format!("Request to {url} failed: {err}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            error!(%status, %url, "request returned error status");
            return Err(MdsError::Access(format!(
                "Request has error. Status code: {}",
                status.as_u16()
            )));
        }

        let body = response
            .bytes()
            .map_err(|e| MdsError::Access(format!("Unable to read response body: {e}")))?;

        if body.is_empty() {
            return Err(MdsError::Access("Response data is not binary.".to_string()));
        }

        Ok(body.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    //! A fetcher backed by an in-memory map, counting hits per url.
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct StaticFetcher {
        resources: Mutex<BTreeMap<String, Vec<u8>>>,
        hits: Mutex<BTreeMap<String, usize>>,
    }

    impl StaticFetcher {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with(self, url: &str, body: &[u8]) -> Self {
            self.insert(url, body);
            self
        }

        pub(crate) fn insert(&self, url: &str, body: &[u8]) {
            self.resources
                .lock()
                .unwrap()
                .insert(url.to_string(), body.to_vec());
        }

        pub(crate) fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    impl Fetch for StaticFetcher {
        fn fetch(&self, url: &Url) -> Result<Vec<u8>> {
            *self
                .hits
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default() += 1;
            self.resources
                .lock()
                .unwrap()
                .get(url.as_str())
                .cloned()
                .ok_or_else(|| MdsError::Access("Request has error. Status code: 404".to_string()))
        }
    }

    #[test]
    fn static_fetcher_counts_hits() {
        let f = StaticFetcher::new().with("https://example.test/a", b"abc");
        let u = Url::parse("https://example.test/a").unwrap();
        assert_eq!(f.fetch(&u).ok(), Some(b"abc".to_vec()));
        assert_eq!(f.fetch_text(&u).ok(), Some("abc".to_string()));
        assert_eq!(f.hits("https://example.test/a"), 2);

        let missing = Url::parse("https://example.test/b").unwrap();
        assert!(matches!(f.fetch(&missing), Err(MdsError::Access(_))));
    }
}
