//! Remote asset reachability checks and scoped access-token propagation.

use crate::types::{CubeError, CubeResult};
use reqwest::StatusCode;
use std::path::PathBuf;
use tempfile::TempDir;

/// Header carrying the access token on every remote request
pub const API_KEY_HEADER: &str = "X-Api-Key";

const HEADER_FILE_OPTION: &str = "GDAL_HTTP_HEADER_FILE";

pub fn is_remote(link: &str) -> bool {
    link.starts_with("http://") || link.starts_with("https://")
}

/// HEAD the asset before GDAL opens it so failures are reported with a
/// reason the caller can act on. Local paths are not checked.
pub fn check_access(url: &str, token: Option<&str>) -> CubeResult<()> {
    if !is_remote(url) {
        return Ok(());
    }

    let token = token.filter(|t| !t.is_empty());

    let client = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| CubeError::Processing(format!("Failed to create HTTP client: {}", e)))?;

    let mut request = client.head(url);
    if let Some(token) = token {
        request = request.header(API_KEY_HEADER, token);
    }

    let response = request.send().map_err(|e| {
        if e.is_connect() || e.is_timeout() {
            CubeError::TransientIo(format!("Connection refused {}: {}", url, e))
        } else {
            CubeError::Http(format!("HEAD {} failed: {}", url, e))
        }
    })?;

    let credentialed = token.is_some() || url.contains("access_token=");
    classify_status(response.status(), url, credentialed)
}

/// Map a HEAD response status onto the error taxonomy.
pub fn classify_status(status: StatusCode, url: &str, credentialed: bool) -> CubeResult<()> {
    let reason = status.canonical_reason().unwrap_or("Unknown");

    if status == StatusCode::FORBIDDEN {
        let msg = if credentialed {
            "You don't have permission to request this resource."
        } else {
            "Missing Authentication Token."
        };
        return Err(CubeError::Access(format!("({}) {} {}", reason, msg, url)));
    }

    if status.is_server_error() {
        return Err(CubeError::Http(format!(
            "({}) Could not request this resource. {}",
            reason, url
        )));
    }

    if status.is_client_error() {
        return Err(CubeError::Http(format!("({}) {}", reason, url)));
    }

    Ok(())
}

/// Attaches an access token to every GDAL HTTP read made on the current
/// thread while the scope is alive.
///
/// The header file lives in a private temporary directory that is removed,
/// together with the GDAL option, when the scope is dropped.
pub struct AccessTokenScope {
    dir: Option<TempDir>,
}

impl AccessTokenScope {
    pub fn new(token: Option<&str>) -> CubeResult<Self> {
        let token = match token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => return Ok(Self { dir: None }),
        };

        let dir = tempfile::tempdir()?;
        let header_file = dir.path().join("http_headers.txt");
        std::fs::write(&header_file, format!("{}: {}", API_KEY_HEADER, token))?;

        gdal::config::set_thread_local_config_option(
            HEADER_FILE_OPTION,
            &header_file.to_string_lossy(),
        )?;

        log::debug!("Access token scope opened");
        Ok(Self { dir: Some(dir) })
    }

    pub fn header_file(&self) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.path().join("http_headers.txt"))
    }

    pub fn is_active(&self) -> bool {
        self.dir.is_some()
    }
}

impl Drop for AccessTokenScope {
    fn drop(&mut self) {
        if self.dir.is_some() {
            if let Err(e) = gdal::config::clear_thread_local_config_option(HEADER_FILE_OPTION) {
                log::warn!("Failed to clear {}: {}", HEADER_FILE_OPTION, e);
            }
        }
    }
}
