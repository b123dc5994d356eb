//! External processors running as subprocesses.
//!
//! A plugin bundle is a TOML manifest listing one or more processors:
//!
//! ```toml
//! version = "1"
//!
//! [[processors]]
//! id = "example"
//! name = "Example Board"
//! command = "./example-plugin"      # relative to the manifest
//! args = ["--format", "json"]
//! hosts = ["cdn.example.org"]
//! advance_on_failure = false
//! reauth_args = ["login"]           # optional
//! ```
//!
//! Each page is one invocation of `command args.. <query> <cursor>`. The
//! process prints a single JSON object on stdout:
//!
//! ```json
//! {"status": "ok", "items": [{"source": "https://...", "hash": "ab12..", "metadata": {}}]}
//! ```
//!
//! `status` is one of `ok`, `auth_expired`, `rate_limited` or `error` and maps
//! onto the pagination loop's outcome classes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};
use url::Url;

use super::error::{FetchError, ProcessError};
use super::pagination::{PageRequest, PageSource, PaginationPolicy, run_retrieval};
use super::registry::RegistryError;
use super::{RetrievalContext, RetrievalProcessor};
use crate::index::{ContentHash, Image, Index};
use crate::schema::{Schema, check_bundle_version};

/// Manifest version this build understands.
pub const PLUGIN_BUNDLE_VERSION: &str = "1";

/// Environment variable carrying the requested page size to plugins.
const PAGE_SIZE_ENV: &str = "HARVESTER_PAGE_SIZE";

/// Upper bound for one plugin invocation.
const INVOCATION_TIMEOUT: Duration = Duration::from_secs(120);

/// A manifest declaring external processors.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginBundle {
    /// Manifest format version.
    pub version: String,
    /// Declared processors.
    #[serde(default)]
    pub processors: Vec<PluginManifest>,
    /// File the bundle was loaded from.
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

/// One processor declared by a plugin bundle.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginManifest {
    /// Unique processor id.
    pub id: String,
    /// Human-readable name; defaults to the id.
    #[serde(default)]
    pub name: Option<String>,
    /// Executable to run.
    pub command: PathBuf,
    /// Arguments placed before the query and cursor.
    #[serde(default)]
    pub args: Vec<String>,
    /// Hosts whose URLs this processor produces.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Skip a failed page instead of retrying it.
    #[serde(default)]
    pub advance_on_failure: bool,
    /// Arguments for a credential refresh run; absent means unsupported.
    #[serde(default)]
    pub reauth_args: Option<Vec<String>>,
    /// First cursor value.
    #[serde(default = "default_start")]
    pub start: u32,
}

fn default_start() -> u32 {
    1
}

impl PluginBundle {
    /// Parses a manifest, resolving relative command paths against the manifest's directory.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Manifest`] for malformed TOML and
    /// [`RegistryError::UnsupportedVersion`] for another major version.
    pub fn from_toml_str(raw: &str, origin: &Path) -> Result<Self, RegistryError> {
        let mut bundle: Self =
            toml::from_str(raw).map_err(|e| RegistryError::manifest(origin, e.to_string()))?;
        check_bundle_version(&bundle.version, PLUGIN_BUNDLE_VERSION).map_err(|_| {
            RegistryError::UnsupportedVersion {
                path: origin.to_path_buf(),
                found: bundle.version.clone(),
                supported: PLUGIN_BUNDLE_VERSION,
            }
        })?;

        let base_dir = origin.parent().unwrap_or_else(|| Path::new("."));
        for manifest in &mut bundle.processors {
            if manifest.command.is_relative() && manifest.command.components().count() > 1 {
                manifest.command = base_dir.join(&manifest.command);
            }
        }
        bundle.path = Some(origin.to_path_buf());
        Ok(bundle)
    }

    /// Reads and parses a manifest file.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Manifest`] if the file cannot be read, plus the
    /// errors of [`PluginBundle::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| RegistryError::manifest(path, e.to_string()))?;
        Self::from_toml_str(&raw, path)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PluginStatus {
    Ok,
    AuthExpired,
    RateLimited,
    Error,
}

#[derive(Debug, Deserialize)]
struct PluginPage {
    status: PluginStatus,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    items: Vec<PluginItem>,
}

#[derive(Debug, Deserialize)]
struct PluginItem {
    source: String,
    hash: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

/// A processor implemented by an external executable.
#[derive(Debug)]
pub struct SubprocessProcessor {
    manifest: PluginManifest,
    policy: PaginationPolicy,
}

impl SubprocessProcessor {
    /// Wraps a manifest entry; the cursor layout comes from the manifest.
    #[must_use]
    pub fn new(manifest: PluginManifest, policy: PaginationPolicy) -> Self {
        let policy = policy
            .with_cursor(manifest.start, 1)
            .advance_on_failure(manifest.advance_on_failure);
        Self { manifest, policy }
    }

    /// Returns the manifest entry.
    #[must_use]
    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    fn command_label(&self) -> String {
        self.manifest.command.display().to_string()
    }

    async fn invoke(&self, args: &[String], page_size: Option<u32>) -> Result<String, FetchError> {
        let mut command = Command::new(&self.manifest.command);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(size) = page_size {
            command.env(PAGE_SIZE_ENV, size.to_string());
        }

        let output = tokio::time::timeout(INVOCATION_TIMEOUT, command.output())
            .await
            .map_err(|_| FetchError::transient(self.command_label(), "plugin timed out"))?
            .map_err(|e| {
                FetchError::transient(self.command_label(), format!("failed to run plugin: {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::transient(
                self.command_label(),
                format!("plugin exited with {}: {}", output.status, stderr.trim()),
            ));
        }
        String::from_utf8(output.stdout).map_err(|_| {
            FetchError::transient(self.command_label(), "plugin output is not UTF-8")
        })
    }

    fn parse_page(&self, stdout: &str) -> Result<PluginPage, FetchError> {
        serde_json::from_str(stdout.trim()).map_err(|e| {
            FetchError::transient(self.command_label(), format!("unreadable plugin output: {e}"))
        })
    }
}

#[async_trait]
impl PageSource for SubprocessProcessor {
    #[instrument(skip(self), fields(processor = %self.manifest.id, page = request.cursor))]
    async fn fetch_page(&self, request: &PageRequest) -> Result<String, FetchError> {
        let mut args = self.manifest.args.clone();
        args.push(request.query.clone());
        args.push(request.cursor.to_string());
        let stdout = self.invoke(&args, request.page_size).await?;

        let page = self.parse_page(&stdout)?;
        let label = self.command_label();
        match page.status {
            PluginStatus::Ok => Ok(stdout),
            PluginStatus::AuthExpired => Err(FetchError::AuthExpired {
                url: label,
                status: 401,
            }),
            PluginStatus::RateLimited => Err(FetchError::RateLimited {
                url: label,
                status: 429,
            }),
            PluginStatus::Error => Err(FetchError::transient(
                label,
                page.message
                    .unwrap_or_else(|| "plugin reported an error".to_string()),
            )),
        }
    }

    fn extract(&self, body: &str, query: &str) -> Result<Vec<Image>, FetchError> {
        let page = self.parse_page(body)?;
        let total = page.items.len();
        let images: Vec<Image> = page
            .items
            .into_iter()
            .filter_map(|item| {
                let source = Url::parse(&item.source).ok()?;
                let hash = ContentHash::from_hex(&item.hash)?;
                let mut image = Image::new(source, query, hash, self.manifest.id.clone());
                image.metadata = item.metadata;
                Some(image)
            })
            .collect();
        if images.len() < total {
            debug!(
                processor = %self.manifest.id,
                skipped = total - images.len(),
                "Skipped plugin items with a bad source or hash"
            );
        }
        Ok(images)
    }

    fn listed_entries(&self, body: &str) -> usize {
        self.parse_page(body).map_or(0, |page| page.items.len())
    }

    async fn reauthenticate(&self) -> Result<(), FetchError> {
        let Some(args) = &self.manifest.reauth_args else {
            return Err(FetchError::ReauthUnsupported);
        };
        self.invoke(args, None)
            .await
            .map(|_| ())
            .map_err(|e| FetchError::AuthFailed {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl RetrievalProcessor for SubprocessProcessor {
    fn id(&self) -> &str {
        &self.manifest.id
    }

    fn informal_name(&self) -> &str {
        self.manifest.name.as_deref().unwrap_or(&self.manifest.id)
    }

    fn recognizes_source(&self, source: &Url) -> bool {
        let Some(host) = source.host_str() else {
            return false;
        };
        self.manifest.hosts.iter().any(|known| {
            host.eq_ignore_ascii_case(known)
                || host
                    .to_ascii_lowercase()
                    .ends_with(&format!(".{}", known.to_ascii_lowercase()))
        })
    }

    async fn process(
        &self,
        index: &mut Index,
        schema: &Schema,
        ctx: &RetrievalContext,
    ) -> Result<Vec<Image>, ProcessError> {
        let command = &self.manifest.command;
        if command.components().count() > 1 && !command.exists() {
            return Err(ProcessError::plugin(
                self.manifest.id.clone(),
                format!("command '{}' does not exist", command.display()),
            ));
        }
        run_retrieval(&self.manifest.id, self, index, schema, ctx, &self.policy).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MANIFEST: &str = r#"
version = "1.2"

[[processors]]
id = "example"
name = "Example Board"
command = "bin/example-plugin"
args = ["--json"]
hosts = ["example.org"]

[[processors]]
id = "bare"
command = "sh"
start = 0
"#;

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest {
            id: id.to_string(),
            name: None,
            command: PathBuf::from("plugin"),
            args: Vec::new(),
            hosts: vec!["example.org".to_string()],
            advance_on_failure: true,
            reauth_args: None,
            start: 0,
        }
    }

    #[test]
    fn test_plugin_bundle_parses_and_resolves_relative_commands() {
        let bundle =
            PluginBundle::from_toml_str(MANIFEST, Path::new("/etc/harvester/plugins.toml")).unwrap();
        assert_eq!(bundle.processors.len(), 2);
        assert_eq!(
            bundle.processors[0].command,
            PathBuf::from("/etc/harvester/bin/example-plugin")
        );
        assert_eq!(bundle.processors[1].command, PathBuf::from("sh"));
        assert_eq!(bundle.processors[1].start, 0);
        assert_eq!(bundle.processors[0].start, 1);
    }

    #[test]
    fn test_plugin_bundle_rejects_other_major_version() {
        let err = PluginBundle::from_toml_str("version = \"2\"", Path::new("p.toml")).unwrap_err();
        assert!(matches!(err, RegistryError::UnsupportedVersion { .. }));
    }

    #[test]
    fn test_plugin_bundle_rejects_malformed_manifest() {
        let err = PluginBundle::from_toml_str("version = 1", Path::new("p.toml")).unwrap_err();
        assert!(matches!(err, RegistryError::Manifest { .. }));
    }

    #[test]
    fn test_subprocess_policy_follows_manifest() {
        let processor = SubprocessProcessor::new(manifest("example"), PaginationPolicy::default());
        assert_eq!(processor.policy.start, 0);
        assert!(processor.policy.advance_on_failure);
        assert_eq!(processor.informal_name(), "example");
    }

    #[test]
    fn test_subprocess_recognizes_declared_hosts() {
        let processor = SubprocessProcessor::new(manifest("example"), PaginationPolicy::default());
        assert!(processor.recognizes_source(&Url::parse("https://img.Example.org/a.jpg").unwrap()));
        assert!(processor.recognizes_source(&Url::parse("https://example.org/a.jpg").unwrap()));
        assert!(!processor.recognizes_source(&Url::parse("https://badexample.org/a.jpg").unwrap()));
    }

    #[test]
    fn test_subprocess_extract_reads_items() {
        let processor = SubprocessProcessor::new(manifest("example"), PaginationPolicy::default());
        let body = r#"{"status":"ok","items":[
            {"source":"https://example.org/a.jpg","hash":"aa11","metadata":{"post_id":"1"}},
            {"source":"not a url","hash":"bb22"}
        ]}"#;
        let images = processor.extract(body, "cats").unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].processor_id, "example");
        assert_eq!(images[0].metadata.get("post_id").unwrap(), "1");
        assert_eq!(processor.listed_entries(body), 2);
        assert!(processor.extract("oops", "cats").is_err());
        assert_eq!(processor.listed_entries("oops"), 0);
    }

    #[tokio::test]
    async fn test_subprocess_missing_command_is_plugin_error() {
        let mut entry = manifest("example");
        entry.command = PathBuf::from("/nonexistent/harvester-plugin");
        let processor = SubprocessProcessor::new(entry, PaginationPolicy::default());
        let err = processor
            .process(
                &mut Index::new("cats"),
                &Schema::new("cats", "example"),
                &RetrievalContext::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Plugin { .. }));
    }

    #[tokio::test]
    async fn test_subprocess_reauth_unsupported_without_args() {
        let processor = SubprocessProcessor::new(manifest("example"), PaginationPolicy::default());
        assert_eq!(
            processor.reauthenticate().await.unwrap_err(),
            FetchError::ReauthUnsupported
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_subprocess_fetch_page_maps_status() {
        let mut entry = manifest("example");
        entry.command = PathBuf::from("sh");
        entry.args = vec![
            "-c".to_string(),
            r#"case "$1" in cats) echo '{"status":"ok","items":[]}' ;; *) echo '{"status":"rate_limited"}' ;; esac"#
                .to_string(),
            "plugin".to_string(),
        ];
        let processor = SubprocessProcessor::new(entry, PaginationPolicy::default());

        let ok = processor
            .fetch_page(&PageRequest {
                query: "cats".to_string(),
                cursor: 0,
                page_size: None,
            })
            .await
            .unwrap();
        assert!(processor.extract(&ok, "cats").unwrap().is_empty());

        let err = processor
            .fetch_page(&PageRequest {
                query: "dogs".to_string(),
                cursor: 0,
                page_size: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_rate_limited());
    }
}
