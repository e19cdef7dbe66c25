//! Transfer transports behind the upload agent.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use magpie_retry::{RetryConfig, calculate_delay};
use magpie_types::UploadAuth;

/// One way of moving a local file to the destination.
pub(crate) trait Transport: Send + Sync {
    /// Deliver `local` as `remote_name` under the destination root.
    fn put(&self, local: &Path, remote_name: &str) -> Result<()>;

    /// Existence probe: size of the remote object, `None` when absent.
    fn probe(&self, remote_name: &str) -> Result<Option<u64>>;
}

/// Plain filesystem copy: local directories, `file://` URLs and mounted
/// UNC shares all end up here.
pub(crate) struct CopyTransport {
    root: PathBuf,
}

impl CopyTransport {
    pub(crate) fn new(destination: &str) -> Result<Self> {
        if destination.starts_with("http://") || destination.starts_with("https://") {
            bail!("copy transport cannot reach {destination}");
        }
        let root = PathBuf::from(
            destination
                .strip_prefix("file://")
                .unwrap_or(destination),
        );
        Ok(Self { root })
    }
}

impl Transport for CopyTransport {
    fn put(&self, local: &Path, remote_name: &str) -> Result<()> {
        let dest = self.root.join(remote_name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::copy(local, &dest).with_context(|| {
            format!("failed to copy {} to {}", local.display(), dest.display())
        })?;
        Ok(())
    }

    fn probe(&self, remote_name: &str) -> Result<Option<u64>> {
        match fs::metadata(self.root.join(remote_name)) {
            Ok(meta) => Ok(Some(meta.len())),
            Err(_) => Ok(None),
        }
    }
}

/// HTTP(S) PUT with HEAD probe, basic authentication and retry/backoff.
pub(crate) struct HttpTransport {
    client: reqwest::blocking::Client,
    base: String,
    auth: UploadAuth,
    retry: RetryConfig,
}

impl HttpTransport {
    pub(crate) fn new(destination: &str, auth: UploadAuth, retry: RetryConfig) -> Result<Self> {
        if !destination.starts_with("http://") && !destination.starts_with("https://") {
            bail!("http transport cannot reach {destination}");
        }
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(600))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            base: destination.trim_end_matches('/').to_string(),
            auth,
            retry,
        })
    }

    fn url(&self, remote_name: &str) -> String {
        format!("{}/{}", self.base, remote_name.trim_start_matches('/'))
    }

    fn apply_auth(
        &self,
        request: reqwest::blocking::RequestBuilder,
    ) -> reqwest::blocking::RequestBuilder {
        match &self.auth {
            UploadAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            _ => request,
        }
    }
}

impl Transport for HttpTransport {
    fn put(&self, local: &Path, remote_name: &str) -> Result<()> {
        // Probe first so reachability problems surface before the body is
        // streamed; an object already present with the right size counts as
        // delivered (resume after an interrupted run).
        let local_size = fs::metadata(local)
            .with_context(|| format!("failed to stat {}", local.display()))?
            .len();
        if self.probe(remote_name)? == Some(local_size) {
            return Ok(());
        }

        let url = self.url(remote_name);
        let mut last_err = None;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            let file = fs::File::open(local)
                .with_context(|| format!("failed to open {}", local.display()))?;
            let request = self.apply_auth(self.client.put(&url).body(file));
            match request.send() {
                Ok(response) if response.status().is_success() => return Ok(()),
                Ok(response) => {
                    last_err = Some(anyhow::anyhow!(
                        "{url} answered {}",
                        response.status()
                    ));
                    // Client errors other than auth/ratelimit will not heal
                    // on retry.
                    let code = response.status().as_u16();
                    if (400..500).contains(&code) && code != 401 && code != 408 && code != 429 {
                        break;
                    }
                }
                Err(e) => {
                    last_err = Some(anyhow::anyhow!("{url}: {e}"));
                }
            }
            if attempt < self.retry.max_attempts {
                std::thread::sleep(calculate_delay(&self.retry, attempt));
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{url}: upload failed")))
    }

    fn probe(&self, remote_name: &str) -> Result<Option<u64>> {
        let url = self.url(remote_name);
        let request = self.apply_auth(self.client.head(&url));
        let response = request
            .send()
            .with_context(|| format!("HEAD {url} failed"))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            bail!("{url}: authentication rejected");
        }
        if !response.status().is_success() {
            // Treat other answers as "absent but reachable"; the PUT will
            // surface a real error if there is one.
            return Ok(None);
        }
        Ok(response.content_length())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn copy_transport_strips_file_scheme() {
        let td = tempdir().expect("tempdir");
        let dest = format!("file://{}", td.path().display());
        let transport = CopyTransport::new(&dest).expect("new");

        let src = td.path().join("src.bin");
        fs::write(&src, b"bytes").expect("write");
        transport.put(&src, "nested/dir/out.bin").expect("put");
        assert_eq!(
            fs::read(td.path().join("nested/dir/out.bin")).expect("read"),
            b"bytes"
        );
        assert_eq!(transport.probe("nested/dir/out.bin").expect("probe"), Some(5));
        assert_eq!(transport.probe("absent").expect("probe"), None);
    }

    #[test]
    fn copy_transport_rejects_http_destinations() {
        assert!(CopyTransport::new("https://example.com/drop").is_err());
    }

    #[test]
    fn http_transport_rejects_plain_paths() {
        assert!(HttpTransport::new("/srv/drop", UploadAuth::Anonymous, RetryConfig::default())
            .is_err());
    }

    #[test]
    fn url_join_handles_slashes() {
        let transport = HttpTransport::new(
            "http://collector.example/drop/",
            UploadAuth::Anonymous,
            RetryConfig::default(),
        )
        .expect("new");
        assert_eq!(
            transport.url("/run1/a.zip"),
            "http://collector.example/drop/run1/a.zip"
        );
    }
}
