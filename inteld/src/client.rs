//! Collector connection: websocket dial, multiplexing, shim download.

use intel_common::mux::MuxSession;
use intel_common::rpc::RpcClient;
use intel_common::ws::WsByteStream;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tracing::{debug, info};

/// Header carrying the session token, matching the HTTP façade. Kept
/// lowercase so it is valid as a static header name.
pub const SESSION_TOKEN_HEADER: &str = "coder-session-token";

#[derive(Debug, Error)]
pub enum DialError {
    /// The collector rejected our credentials. Permanent; do not retry.
    #[error("collector rejected the session token (403)")]
    Forbidden,
    #[error("collector refused the connection: HTTP {0}")]
    Http(u16),
    #[error("invalid collector url {0:?}")]
    InvalidUrl(String),
    #[error(transparent)]
    Websocket(tungstenite::Error),
    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl DialError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, DialError::Forbidden)
    }
}

/// Connection settings for one collector.
#[derive(Debug, Clone)]
pub struct Connector {
    pub base_url: String,
    pub token: String,
    pub organization: String,
    pub instance_id: String,
}

impl Connector {
    fn ws_base(&self) -> Result<String, DialError> {
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            Ok(format!("wss://{rest}"))
        } else if let Some(rest) = base.strip_prefix("http://") {
            Ok(format!("ws://{rest}"))
        } else {
            Err(DialError::InvalidUrl(self.base_url.clone()))
        }
    }

    /// Dial the collector and stand up the RPC client over the multiplexed
    /// websocket.
    pub async fn dial(
        &self,
        metadata: &HashMap<String, String>,
    ) -> Result<RpcClient, DialError> {
        let metadata_json = serde_json::to_string(metadata)?;
        let url = format!(
            "{}/api/v2/organizations/{}/intel/serve?instance_id={}&daemon_version={}&metadata={}",
            self.ws_base()?,
            urlencode(&self.organization),
            urlencode(&self.instance_id),
            urlencode(env!("CARGO_PKG_VERSION")),
            urlencode(&metadata_json),
        );
        let mut request = url
            .clone()
            .into_client_request()
            .map_err(|_| DialError::InvalidUrl(url.clone()))?;
        request.headers_mut().insert(
            SESSION_TOKEN_HEADER,
            self.token
                .parse()
                .map_err(|_| DialError::InvalidUrl("invalid session token".into()))?,
        );

        let (socket, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|err| match err {
                tungstenite::Error::Http(resp) if resp.status().as_u16() == 403 => {
                    DialError::Forbidden
                }
                tungstenite::Error::Http(resp) => DialError::Http(resp.status().as_u16()),
                other => DialError::Websocket(other),
            })?;
        debug!(status = %response.status(), "websocket established");

        let session = MuxSession::client(WsByteStream::new(socket));
        Ok(RpcClient::new(session))
    }

    /// Conditionally download the shim binary for this platform into
    /// `target`, keeping the existing file when the collector answers 304.
    pub async fn download_shim_binary(&self, target: &Path) -> anyhow::Result<()> {
        let mut filename = format!(
            "coder-intel-invoke-{}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        );
        if cfg!(windows) {
            filename.push_str(".exe");
        }
        let url = format!(
            "{}/bin/{}",
            self.base_url.trim_end_matches('/'),
            filename
        );

        let etag = match tokio::fs::try_exists(target).await {
            Ok(true) => {
                let path = target.to_path_buf();
                Some(tokio::task::spawn_blocking(move || {
                    intel_common::hash::sample_file(&path)
                })
                .await??)
            }
            _ => None,
        };

        let client = reqwest::Client::new();
        let mut request = client.get(&url).header(SESSION_TOKEN_HEADER, &self.token);
        if let Some(etag) = &etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, format!("\"{etag}\""));
        }
        let response = request.send().await?;
        match response.status().as_u16() {
            304 => {
                debug!(path = %target.display(), "shim binary is current");
                return Ok(());
            }
            200 => {}
            status => anyhow::bail!("unexpected status code downloading shim binary: {status}"),
        }

        let body = response.bytes().await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a shim launched mid-download never sees a
        // truncated binary.
        let staged = target.with_extension("download");
        tokio::fs::write(&staged, &body).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await?;
        }
        tokio::fs::rename(&staged, target).await?;
        info!(path = %target.display(), bytes = body.len(), "downloaded shim binary");
        Ok(())
    }
}

/// Percent-encode a query-string value. Only the characters that can
/// corrupt the query need escaping here.
fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
