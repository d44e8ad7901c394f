//! Registry resolver for pods.
//!
//! Given a coordinate like `org.babashka/instaparse` and a version, the
//! resolver fetches the registry manifest, picks the artifact matching the
//! current platform, downloads and checksum-verifies it, extracts archives,
//! and installs the result atomically into the local cache. A cache hit
//! resolves without touching the network.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use pods_format::{edn, Handlers, Value};

pub const DEFAULT_BASE_URL: &str =
    "https://raw.githubusercontent.com/babashka/pod-registry/master/manifests";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("invalid pod coordinate {0:?} (expected qualifier/name)")]
    InvalidCoordinate(String),
    #[error("no manifest for {coordinate} version {version}")]
    ManifestMissing { coordinate: String, version: String },
    #[error("manifest parse: {0}")]
    ManifestParse(String),
    #[error("no pod artifact for platform {os}/{arch}")]
    PlatformUnsupported { os: String, arch: String },
    #[error("sha256 mismatch for {url}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("archive {0}")]
    Archive(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PodManifest {
    pub name: String,
    pub artifacts: Vec<Artifact>,
    /// Extra load options declared by the manifest (`:pod/options`),
    /// merged into the host's load options by the caller.
    pub options: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct Artifact {
    /// OS name pattern; the upstream registry writes alternations like
    /// `"Mac OS X|macos"`.
    pub os_name: String,
    pub os_arch: String,
    pub url: String,
    pub executable: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ResolvedPod {
    pub coordinate: String,
    pub version: String,
    pub executable: PathBuf,
    pub options: Option<Value>,
}

pub struct PodRegistry {
    base_url: String,
    cache_root: PathBuf,
}

impl Default for PodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PodRegistry {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cache_root: default_cache_root(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        while self.base_url.ends_with('/') {
            self.base_url.pop();
        }
        self
    }

    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve a coordinate/version to an installed executable. With
    /// `force`, any cached install is discarded and re-downloaded.
    pub fn resolve(
        &self,
        coordinate: &str,
        version: &str,
        force: bool,
    ) -> Result<ResolvedPod, ResolveError> {
        let (qualifier, name) = split_coordinate(coordinate)?;
        let (os, arch) = current_platform();

        let install_dir = self
            .cache_root
            .join("repository")
            .join(qualifier)
            .join(name)
            .join(version)
            .join(&os)
            .join(&arch);

        if !force {
            if let Some(resolved) = self.cached(&install_dir, coordinate, version, &os, &arch)? {
                debug!(coordinate, version, "pod cache hit");
                return Ok(resolved);
            }
        }

        let manifest_url = format!("{}/{qualifier}/{name}/{version}/manifest.edn", self.base_url);
        debug!(%manifest_url, "fetching pod manifest");
        let manifest_text = match fetch_string(&manifest_url) {
            Ok(text) => text,
            Err(FetchFailure::NotFound) => {
                return Err(ResolveError::ManifestMissing {
                    coordinate: coordinate.to_string(),
                    version: version.to_string(),
                })
            }
            Err(FetchFailure::Other(reason)) => {
                return Err(ResolveError::Fetch {
                    url: manifest_url,
                    reason,
                })
            }
        };
        let manifest = parse_manifest(&manifest_text)?;
        let artifact = select_artifact(&manifest.artifacts, &os, &arch)?;
        let entry_name = entrypoint_name(artifact);

        let parent = install_dir
            .parent()
            .ok_or_else(|| ResolveError::Archive("install dir has no parent".to_string()))?;
        std::fs::create_dir_all(parent)?;
        let tmp_dir = unique_tmp_dir(parent)?;

        let result = install_into(&tmp_dir, artifact, &entry_name, &manifest_text);
        if let Err(err) = result {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            return Err(err);
        }

        if install_dir.exists() {
            std::fs::remove_dir_all(&install_dir)?;
        }
        std::fs::rename(&tmp_dir, &install_dir)?;

        Ok(ResolvedPod {
            coordinate: coordinate.to_string(),
            version: version.to_string(),
            executable: install_dir.join(&entry_name),
            options: manifest.options,
        })
    }

    fn cached(
        &self,
        install_dir: &Path,
        coordinate: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<Option<ResolvedPod>, ResolveError> {
        let manifest_copy = install_dir.join("manifest.edn");
        if !manifest_copy.is_file() {
            return Ok(None);
        }
        let manifest = match parse_manifest(&std::fs::read_to_string(&manifest_copy)?) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(%err, "cached manifest unreadable; re-resolving");
                return Ok(None);
            }
        };
        let artifact = select_artifact(&manifest.artifacts, os, arch)?;
        let executable = install_dir.join(entrypoint_name(artifact));
        if !executable.is_file() {
            return Ok(None);
        }
        Ok(Some(ResolvedPod {
            coordinate: coordinate.to_string(),
            version: version.to_string(),
            executable,
            options: manifest.options,
        }))
    }
}

/// `$BABASHKA_PODS_DIR`, else `$XDG_CACHE_HOME/babashka/pods`, else
/// `~/.cache/babashka/pods`.
pub fn default_cache_root() -> PathBuf {
    if let Ok(dir) = std::env::var("BABASHKA_PODS_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    if let Ok(dir) = std::env::var("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("babashka").join("pods");
        }
    }
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cache").join("babashka").join("pods")
}

pub fn current_platform() -> (String, String) {
    (
        std::env::consts::OS.to_string(),
        std::env::consts::ARCH.to_string(),
    )
}

fn split_coordinate(coordinate: &str) -> Result<(&str, &str), ResolveError> {
    match coordinate.split_once('/') {
        Some((qualifier, name)) if !qualifier.is_empty() && !name.is_empty() => {
            Ok((qualifier, name))
        }
        _ => Err(ResolveError::InvalidCoordinate(coordinate.to_string())),
    }
}

pub fn parse_manifest(text: &str) -> Result<PodManifest, ResolveError> {
    let value = edn::from_edn(text, &Handlers::new())
        .map_err(|e| ResolveError::ManifestParse(e.to_string()))?;
    let name = match value.get("pod/name") {
        Some(Value::Symbol(s)) | Some(Value::String(s)) => s.clone(),
        _ => return Err(ResolveError::ManifestParse("missing :pod/name".to_string())),
    };
    let raw_artifacts = match value.get("pod/artifacts") {
        Some(Value::Vector(items)) | Some(Value::List(items)) => items.as_slice(),
        _ => {
            return Err(ResolveError::ManifestParse(
                "missing :pod/artifacts".to_string(),
            ))
        }
    };
    let mut artifacts = Vec::with_capacity(raw_artifacts.len());
    for raw in raw_artifacts {
        let os = raw
            .get("os")
            .ok_or_else(|| ResolveError::ManifestParse("artifact missing :os".to_string()))?;
        let os_name = string_field(os, "name")
            .ok_or_else(|| ResolveError::ManifestParse("artifact os missing :name".to_string()))?;
        let os_arch = string_field(os, "arch")
            .ok_or_else(|| ResolveError::ManifestParse("artifact os missing :arch".to_string()))?;
        let url = string_field(raw, "artifact/url").ok_or_else(|| {
            ResolveError::ManifestParse("artifact missing :artifact/url".to_string())
        })?;
        artifacts.push(Artifact {
            os_name,
            os_arch,
            url,
            executable: string_field(raw, "artifact/executable"),
            sha256: string_field(raw, "artifact/sha256"),
        });
    }
    Ok(PodManifest {
        name,
        artifacts,
        options: value.get("pod/options").cloned(),
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    }
}

/// First artifact matching the platform. On macOS aarch64 with no native
/// artifact, an x86_64 artifact is accepted (Rosetta).
pub fn select_artifact<'a>(
    artifacts: &'a [Artifact],
    os: &str,
    arch: &str,
) -> Result<&'a Artifact, ResolveError> {
    let find = |arch: &str| {
        artifacts
            .iter()
            .find(|a| os_matches(&a.os_name, os) && arch_matches(&a.os_arch, arch))
    };
    if let Some(artifact) = find(arch) {
        return Ok(artifact);
    }
    if os == "macos" && arch == "aarch64" {
        if let Some(artifact) = find("x86_64") {
            debug!("no native aarch64 artifact, falling back to x86_64");
            return Ok(artifact);
        }
    }
    Err(ResolveError::PlatformUnsupported {
        os: os.to_string(),
        arch: arch.to_string(),
    })
}

/// Manifest os names are alternations of literal names ("Mac OS X|macos").
fn os_matches(pattern: &str, os: &str) -> bool {
    pattern.split('|').any(|alt| {
        let alt = alt.trim().to_ascii_lowercase();
        match os {
            "linux" => alt.contains("linux"),
            "macos" => alt.contains("mac") || alt.contains("darwin"),
            "windows" => alt.contains("windows"),
            other => alt == other,
        }
    })
}

fn arch_matches(pattern: &str, arch: &str) -> bool {
    pattern.split('|').any(|alt| {
        let normalized = match alt.trim() {
            "amd64" | "x86_64" => "x86_64",
            "arm64" | "aarch64" => "aarch64",
            other => other,
        };
        normalized == arch
    })
}

fn entrypoint_name(artifact: &Artifact) -> String {
    if let Some(executable) = &artifact.executable {
        return executable.clone();
    }
    let file = artifact
        .url
        .rsplit('/')
        .next()
        .unwrap_or(artifact.url.as_str());
    for suffix in [".tar.gz", ".tgz", ".zip"] {
        if let Some(stripped) = file.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    file.to_string()
}

fn install_into(
    tmp_dir: &Path,
    artifact: &Artifact,
    entry_name: &str,
    manifest_text: &str,
) -> Result<(), ResolveError> {
    let file_name = artifact
        .url
        .rsplit('/')
        .next()
        .unwrap_or("artifact")
        .to_string();
    let download_path = tmp_dir.join(&file_name);
    download_verify(&artifact.url, &download_path, artifact.sha256.as_deref())?;

    if let Some(kind) = archive_kind(&file_name) {
        debug!(url = %artifact.url, "extracting pod archive");
        match kind {
            ArchiveKind::TarGz => extract_tar_gz(&download_path, tmp_dir)?,
            ArchiveKind::Zip => extract_zip(&download_path, tmp_dir)?,
        }
        std::fs::remove_file(&download_path)?;
    } else if file_name != entry_name {
        std::fs::rename(&download_path, tmp_dir.join(entry_name))?;
    }

    let entry_path = tmp_dir.join(entry_name);
    if !entry_path.is_file() {
        return Err(ResolveError::Archive(format!(
            "artifact did not provide entrypoint {entry_name:?}"
        )));
    }
    make_executable(&entry_path)?;

    std::fs::write(tmp_dir.join("manifest.edn"), manifest_text.as_bytes())?;
    Ok(())
}

enum ArchiveKind {
    TarGz,
    Zip,
}

fn archive_kind(file_name: &str) -> Option<ArchiveKind> {
    if file_name.ends_with(".tar.gz") || file_name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if file_name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else {
        None
    }
}

enum FetchFailure {
    NotFound,
    Other(String),
}

fn fetch_string(url: &str) -> Result<String, FetchFailure> {
    let bytes = fetch_bytes(url)?;
    String::from_utf8(bytes).map_err(|_| FetchFailure::Other("response is not utf-8".to_string()))
}

fn fetch_bytes(url: &str) -> Result<Vec<u8>, FetchFailure> {
    let parsed = Url::parse(url).map_err(|e| FetchFailure::Other(e.to_string()))?;
    match parsed.scheme() {
        "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| FetchFailure::Other("bad file url".to_string()))?;
            match std::fs::read(&path) {
                Ok(bytes) => Ok(bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(FetchFailure::NotFound)
                }
                Err(err) => Err(FetchFailure::Other(err.to_string())),
            }
        }
        "http" | "https" => match ureq::get(url).call() {
            Ok(resp) => {
                let mut reader = resp.into_body().into_reader();
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .map_err(|e| FetchFailure::Other(e.to_string()))?;
                Ok(buf)
            }
            Err(ureq::Error::StatusCode(404)) => Err(FetchFailure::NotFound),
            Err(err) => Err(FetchFailure::Other(err.to_string())),
        },
        other => Err(FetchFailure::Other(format!("unsupported url scheme {other:?}"))),
    }
}

fn download_verify(
    url: &str,
    dest: &Path,
    expected_sha256: Option<&str>,
) -> Result<(), ResolveError> {
    let bytes = match fetch_bytes(url) {
        Ok(bytes) => bytes,
        Err(FetchFailure::NotFound) => {
            return Err(ResolveError::Fetch {
                url: url.to_string(),
                reason: "not found".to_string(),
            })
        }
        Err(FetchFailure::Other(reason)) => {
            return Err(ResolveError::Fetch {
                url: url.to_string(),
                reason,
            })
        }
    };

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let actual = hex_lower(&hasher.finalize());
    match expected_sha256 {
        Some(expected) => {
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(ResolveError::ChecksumMismatch {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }
        None => warn!(%url, "manifest declares no sha256; installing unverified"),
    }

    let mut f = std::fs::File::create(dest)?;
    f.write_all(&bytes)?;
    f.flush()?;
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0f) as usize] as char);
    }
    out
}

fn unique_tmp_dir(parent: &Path) -> Result<PathBuf, ResolveError> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let pid = std::process::id();
    for _ in 0..10_000 {
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = parent.join(format!(".tmp-{pid}-{n}"));
        match std::fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Err(ResolveError::Archive(format!(
        "failed to create unique temp dir under {}",
        parent.display()
    )))
}

fn extract_tar_gz(path: &Path, out_dir: &Path) -> Result<(), ResolveError> {
    let f = std::fs::File::open(path)?;
    let gz = GzDecoder::new(f);
    let mut archive = tar::Archive::new(gz);
    for entry in archive
        .entries()
        .map_err(|e| ResolveError::Archive(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| ResolveError::Archive(e.to_string()))?;
        let entry_path = entry
            .path()
            .map_err(|e| ResolveError::Archive(e.to_string()))?
            .into_owned();
        let rel = sanitize_rel_path(&entry_path)?;
        let out_path = out_dir.join(rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&out_path)
            .map_err(|e| ResolveError::Archive(format!("unpack {}: {e}", out_path.display())))?;
    }
    Ok(())
}

fn extract_zip(path: &Path, out_dir: &Path) -> Result<(), ResolveError> {
    let f = std::fs::File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(f).map_err(|e| ResolveError::Archive(e.to_string()))?;
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .map_err(|e| ResolveError::Archive(e.to_string()))?;
        let name = file.name().to_string();
        let rel = sanitize_rel_path(Path::new(&name))?;
        let out_path = out_dir.join(rel);
        if file.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&out_path)?;
        std::io::copy(&mut file, &mut out)?;
    }
    Ok(())
}

fn sanitize_rel_path(path: &Path) -> Result<PathBuf, ResolveError> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(ResolveError::Archive(format!(
                    "absolute archive path: {}",
                    path.display()
                )))
            }
            Component::ParentDir => {
                return Err(ResolveError::Archive(format!(
                    "archive path escapes destination: {}",
                    path.display()
                )))
            }
            Component::CurDir => {}
            Component::Normal(p) => out.push(p),
        }
    }
    Ok(out)
}

fn make_executable(path: &Path) -> Result<(), ResolveError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
