//! Worker-side stage-in / stage-out.
//!
//! Three source modes: plain paths already on the worker's filesystem,
//! `file://` URLs on a shared POSIX mount, and `http(s)://` URLs
//! downloaded with retries and per-host credentials. Stage-out mirrors
//! them; HTTP uploads substitute `{taskID}` and `{filename}` into the
//! configured upload path.

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use weft_core::{CwlValue, Error, Result, ResourceId};

use crate::client::{build_http_client, ClientConfig};

/// How a single source should be staged.
#[derive(Debug, Clone, PartialEq)]
pub enum StageMode {
    /// Already local; nothing to do.
    Local(String),
    /// Copy from a shared POSIX mount.
    SharedFile(String),
    /// Download over HTTP.
    Http(String),
}

pub fn classify(source: &str) -> StageMode {
    if let Some(path) = source.strip_prefix("file://") {
        return StageMode::SharedFile(path.to_string());
    }
    if source.starts_with("http://") || source.starts_with("https://") {
        return StageMode::Http(source.to_string());
    }
    StageMode::Local(source.to_string())
}

/// Per-host credentials loaded from a JSON file:
/// `{"host": {"bearer": "..."} , "other": {"user": "...", "password": "..."}}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostCredential {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
pub enum UploadMethod {
    Put,
    Post,
}

#[derive(Debug, Clone)]
pub struct StagerConfig {
    pub http_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub credentials_path: Option<PathBuf>,
    /// Upload template with `{taskID}` and `{filename}` placeholders.
    pub upload_path: Option<String>,
    pub upload_method: UploadMethod,
    pub insecure_skip_verify: bool,
    pub ca_bundle: Option<PathBuf>,
}

impl Default for StagerConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            credentials_path: None,
            upload_path: None,
            upload_method: UploadMethod::Put,
            insecure_skip_verify: false,
            ca_bundle: None,
        }
    }
}

pub struct Stager {
    http: reqwest::Client,
    credentials: HashMap<String, HostCredential>,
    config: StagerConfig,
}

pub fn substitute_upload_path(template: &str, task_id: ResourceId, filename: &str) -> String {
    template
        .replace("{taskID}", &task_id.to_string())
        .replace("{filename}", filename)
}

impl Stager {
    pub fn new(config: StagerConfig) -> Result<Self> {
        let client_config = ClientConfig {
            base_url: String::new(),
            timeout: config.http_timeout,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay,
            insecure_skip_verify: config.insecure_skip_verify,
            ca_bundle: config.ca_bundle.clone(),
        };
        let http = build_http_client(&client_config)?;
        let credentials = match &config.credentials_path {
            Some(path) => load_credentials(path)?,
            None => HashMap::new(),
        };
        Ok(Self {
            http,
            credentials,
            config,
        })
    }

    /// Make every File input locally available under `workdir`.
    pub async fn stage_in(
        &self,
        inputs: &mut BTreeMap<String, CwlValue>,
        workdir: &Path,
    ) -> Result<()> {
        for value in inputs.values_mut() {
            self.stage_in_value(value, workdir).await?;
        }
        Ok(())
    }

    async fn stage_in_value(&self, value: &mut CwlValue, workdir: &Path) -> Result<()> {
        match value {
            CwlValue::File(file) => {
                let source = file
                    .location
                    .clone()
                    .or_else(|| file.path.clone());
                if let Some(source) = source {
                    match classify(&source) {
                        StageMode::Local(path) => {
                            file.path = Some(path);
                        }
                        StageMode::SharedFile(path) => {
                            let basename = file
                                .effective_basename()
                                .unwrap_or_else(|| "input".to_string());
                            let dest = workdir.join(&basename);
                            fs::copy(&path, &dest).map_err(|e| {
                                Error::staging_io(format!("copying {path}: {e}"))
                            })?;
                            file.path = Some(dest.to_string_lossy().into_owned());
                        }
                        StageMode::Http(url) => {
                            let basename = file
                                .effective_basename()
                                .or_else(|| basename_from_url(&url))
                                .unwrap_or_else(|| "download".to_string());
                            let dest = workdir.join(&basename);
                            self.download(&url, &dest).await?;
                            file.path = Some(dest.to_string_lossy().into_owned());
                            file.basename = Some(basename);
                        }
                    }
                }
                for secondary in &mut file.secondary_files {
                    Box::pin(self.stage_in_value(secondary, workdir)).await?;
                }
            }
            CwlValue::Directory(dir) => {
                for item in &mut dir.listing {
                    Box::pin(self.stage_in_value(item, workdir)).await?;
                }
            }
            CwlValue::Array(items) => {
                for item in items {
                    Box::pin(self.stage_in_value(item, workdir)).await?;
                }
            }
            CwlValue::Record(fields) => {
                for item in fields.values_mut() {
                    Box::pin(self.stage_in_value(item, workdir)).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_download(url, dest).await {
                Ok(()) => {
                    info!(url = %url, dest = %dest.display(), "staged input");
                    return Ok(());
                }
                Err(e) if attempt <= self.config.max_retries => {
                    warn!(url = %url, attempt, error = %e, "download failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_download(&self, url: &str, dest: &Path) -> Result<()> {
        let request = self.with_credentials(self.http.get(url), url);
        let response = request
            .send()
            .await
            .map_err(|e| Error::staging_io(format!("GET {url}: {e}")))?
            .error_for_status()
            .map_err(|e| Error::staging_io(format!("GET {url}: {e}")))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::staging_io(format!("GET {url}: {e}")))?;
        fs::write(dest, &bytes)
            .map_err(|e| Error::staging_io(format!("writing {}: {e}", dest.display())))
    }

    fn with_credentials(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let Some(host) = Url::parse(url).ok().and_then(|u| u.host_str().map(String::from))
        else {
            return request;
        };
        let Some(credential) = self.credentials.get(&host) else {
            return request;
        };
        if let Some(bearer) = &credential.bearer {
            return request.bearer_auth(bearer);
        }
        if let Some(user) = &credential.user {
            return request.basic_auth(user, credential.password.as_deref());
        }
        request
    }

    /// Push output files to the configured upload endpoint; without one
    /// the files stay on the shared filesystem and keep their paths.
    pub async fn stage_out(
        &self,
        task_id: ResourceId,
        outputs: &mut BTreeMap<String, CwlValue>,
    ) -> Result<()> {
        let Some(template) = self.config.upload_path.clone() else {
            return Ok(());
        };
        for value in outputs.values_mut() {
            self.stage_out_value(value, task_id, &template).await?;
        }
        Ok(())
    }

    async fn stage_out_value(
        &self,
        value: &mut CwlValue,
        task_id: ResourceId,
        template: &str,
    ) -> Result<()> {
        match value {
            CwlValue::File(file) => {
                if let Some(path) = file.path.clone() {
                    let filename = file
                        .effective_basename()
                        .unwrap_or_else(|| "output".to_string());
                    let url = substitute_upload_path(template, task_id, &filename);
                    self.upload(&path, &url).await?;
                    file.location = Some(url);
                }
            }
            CwlValue::Array(items) => {
                for item in items {
                    Box::pin(self.stage_out_value(item, task_id, template)).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn upload(&self, path: &str, url: &str) -> Result<()> {
        let bytes = fs::read(path)
            .map_err(|e| Error::staging_io(format!("reading {path}: {e}")))?;
        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let request = match self.config.upload_method {
                UploadMethod::Put => self.http.put(url),
                UploadMethod::Post => self.http.post(url),
            };
            let result = self
                .with_credentials(request, url)
                .body(bytes.clone())
                .send()
                .await
                .and_then(|r| r.error_for_status());
            match result {
                Ok(_) => {
                    debug!(path = %path, url = %url, "staged output");
                    return Ok(());
                }
                Err(e) if attempt <= self.config.max_retries => {
                    warn!(url = %url, attempt, error = %e, "upload failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(Error::staging_io(format!("PUT {url}: {e}"))),
            }
        }
    }
}

fn load_credentials(path: &Path) -> Result<HashMap<String, HostCredential>> {
    let text = fs::read_to_string(path)
        .map_err(|e| Error::System(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| Error::Validation(format!("credentials {}: {e}", path.display())))
}

fn basename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_classify_by_scheme() {
        assert_eq!(
            classify("/data/in.txt"),
            StageMode::Local("/data/in.txt".into())
        );
        assert_eq!(
            classify("file:///mnt/shared/in.txt"),
            StageMode::SharedFile("/mnt/shared/in.txt".into())
        );
        assert_eq!(
            classify("https://example.org/in.txt"),
            StageMode::Http("https://example.org/in.txt".into())
        );
    }

    #[test]
    fn upload_template_substitution() {
        let id = ResourceId::new();
        let url = substitute_upload_path(
            "https://store.example.org/tasks/{taskID}/files/{filename}",
            id,
            "result.txt",
        );
        assert_eq!(
            url,
            format!("https://store.example.org/tasks/{id}/files/result.txt")
        );
    }

    #[test]
    fn credentials_file_parses_both_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(
            &path,
            r#"{
                "data.example.org": {"bearer": "tok"},
                "mirror.example.org": {"user": "alice", "password": "s3cret"}
            }"#,
        )
        .unwrap();
        let creds = load_credentials(&path).unwrap();
        assert_eq!(creds["data.example.org"].bearer.as_deref(), Some("tok"));
        assert_eq!(creds["mirror.example.org"].user.as_deref(), Some("alice"));
    }

    #[test]
    fn url_basenames_fall_back_sensibly() {
        assert_eq!(
            basename_from_url("https://example.org/a/b/reads.fq").as_deref(),
            Some("reads.fq")
        );
        assert!(basename_from_url("https://example.org/").is_none());
    }
}
