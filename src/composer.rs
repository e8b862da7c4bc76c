//! Composer metadata extraction
//!
//! Reads just enough of `composer.json` / `composer.lock` to drive the
//! indexer: composer-type repositories, locked package coordinates with
//! their source/dist references, `replace` declarations, and package
//! names. Also locates Composer's `auth.json` / `config.json` the way
//! Composer itself does: from the working directory upward, then
//! `$HOME/.composer/`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CorediffError, Result};

/// Packagist's canonical metadata endpoint, appended as an implicit
/// fallback repository when a project does not list it.
pub const PACKAGIST_URL: &str = "https://repo.packagist.org";

/// A single entry in the composer.json `repositories` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Repository {
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
}

/// Git source metadata from composer.lock.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub reference: String,
}

/// Distribution (zip) metadata from composer.lock.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DistRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub reference: String,
}

/// A single entry in the composer.lock `packages` array.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LockPackage {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: SourceRef,
    pub dist: DistRef,
}

/// Parsed result of a composer.json + composer.lock pair.
#[derive(Debug)]
pub struct ComposerProject {
    pub repos: Vec<Repository>,
    pub packages: Vec<LockPackage>,
}

/// Read a composer.json and its sibling composer.lock. Repositories are
/// filtered to composer-type entries; lock packages exclude platform and
/// meta packages. Packagist is appended as an implicit fallback repo.
pub fn parse_project(json_path: &Path) -> Result<ComposerProject> {
    let json_data = std::fs::read(json_path)
        .map_err(|e| CorediffError::composer(format!("reading {}: {e}", json_path.display())))?;

    let lock_path = json_path.with_file_name("composer.lock");
    let lock_data = std::fs::read(&lock_path)
        .map_err(|e| CorediffError::composer(format!("reading {}: {e}", lock_path.display())))?;

    let mut repos = parse_repos(&json_data)?;
    let packages = parse_lock_packages(&lock_data)?;

    if !repos.iter().any(|r| r.url.contains("packagist.org")) {
        repos.push(Repository {
            kind: "composer".to_string(),
            url: PACKAGIST_URL.to_string(),
        });
    }

    Ok(ComposerProject { repos, packages })
}

/// Extract composer-type repositories. Handles both the object form
/// (keyed by name) and the array form.
pub fn parse_repos(data: &[u8]) -> Result<Vec<Repository>> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default)]
        repositories: Option<serde_json::Value>,
    }

    let raw: Raw = serde_json::from_slice(data)
        .map_err(|e| CorediffError::composer(format!("parsing composer.json: {e}")))?;
    let Some(value) = raw.repositories else {
        return Ok(Vec::new());
    };

    let entries: Vec<Repository> = match value {
        serde_json::Value::Object(map) => map
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect(),
        serde_json::Value::Array(arr) => arr
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => {
            return Err(CorediffError::composer(
                "repositories is neither object nor array",
            ))
        }
    };

    Ok(entries
        .into_iter()
        .filter(|r| r.kind == "composer")
        .map(|mut r| {
            r.url = normalize_repo_url(&r.url);
            r
        })
        .collect())
}

/// Strip trailing `/packages.json` and trailing slashes from a repo URL.
pub fn normalize_repo_url(u: &str) -> String {
    let u = u.strip_suffix("/packages.json").unwrap_or(u);
    u.trim_end_matches('/').to_string()
}

/// Extract non-meta, non-platform packages from composer.lock. Only
/// `packages` is read; `packages-dev` is never indexed.
pub fn parse_lock_packages(data: &[u8]) -> Result<Vec<LockPackage>> {
    #[derive(Deserialize)]
    struct Lock {
        #[serde(default)]
        packages: Vec<LockPackage>,
    }

    let lock: Lock = serde_json::from_slice(data)
        .map_err(|e| CorediffError::composer(format!("parsing composer.lock: {e}")))?;

    Ok(lock
        .packages
        .into_iter()
        .filter(|p| !is_platform_package(&p.name) && p.kind != "metapackage")
        .collect())
}

/// Package names from the `replace` section, keeping only standard
/// `vendor/package` names (exactly one slash).
pub fn parse_replace(data: &[u8]) -> Result<Vec<String>> {
    #[derive(Deserialize)]
    struct Raw {
        #[serde(default)]
        replace: HashMap<String, serde_json::Value>,
    }

    let raw: Raw = serde_json::from_slice(data)
        .map_err(|e| CorediffError::composer(format!("parsing composer.json: {e}")))?;

    Ok(raw
        .replace
        .into_keys()
        .filter(|name| name.matches('/').count() == 1)
        .collect())
}

/// The `name` field of a composer.json, or empty when missing/invalid.
pub fn parse_name(data: &[u8]) -> String {
    parse_string_field(data, "name")
}

/// The `version` field of a composer.json, or empty when missing/invalid.
pub fn parse_version(data: &[u8]) -> String {
    parse_string_field(data, "version")
}

fn parse_string_field(data: &[u8], field: &str) -> String {
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|v| v.get(field)?.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Whether a lock entry names the PHP platform rather than a package.
fn is_platform_package(name: &str) -> bool {
    name == "php" || name.starts_with("ext-")
}

// ---------------------------------------------------------------------
// auth.json / config.json discovery
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BasicAuth {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// A Composer auth.json file: credentials keyed by host.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    #[serde(rename = "http-basic")]
    pub http_basic: HashMap<String, BasicAuth>,
    pub bearer: HashMap<String, String>,
    #[serde(rename = "github-oauth")]
    pub github_oauth: HashMap<String, String>,
}

impl AuthConfig {
    /// Summary of configured hosts, e.g. `["http-basic: repo.magento.com"]`.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts = Vec::new();
        for h in self.http_basic.keys() {
            hosts.push(format!("http-basic: {h}"));
        }
        for h in self.bearer.keys() {
            hosts.push(format!("bearer: {h}"));
        }
        for h in self.github_oauth.keys() {
            hosts.push(format!("github-oauth: {h}"));
        }
        hosts
    }

    /// The Authorization header value for `host`, if credentials exist.
    pub fn authorization_for(&self, host: &str) -> Option<String> {
        use base64::Engine;
        if let Some(cred) = self.http_basic.get(host) {
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", cred.username, cred.password));
            return Some(format!("Basic {encoded}"));
        }
        if let Some(token) = self.bearer.get(host) {
            return Some(format!("Bearer {token}"));
        }
        if let Some(token) = self.github_oauth.get(host) {
            return Some(format!("token {token}"));
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.http_basic.is_empty() && self.bearer.is_empty() && self.github_oauth.is_empty()
    }
}

/// Search for a Composer auth.json by walking from the current working
/// directory upward, then checking `$HOME/.composer/auth.json`.
pub fn find_auth_config() -> Result<Option<AuthConfig>> {
    let cwd = std::env::current_dir()?;
    find_auth_config_from(&cwd, dirs::home_dir())
}

/// Exposed for testing: the search rooted at `start` with an explicit
/// home directory.
pub fn find_auth_config_from(start: &Path, home: Option<PathBuf>) -> Result<Option<AuthConfig>> {
    for dir in start.ancestors() {
        if let Some(ac) = try_load_auth(&dir.join(".composer").join("auth.json"))? {
            return Ok(Some(ac));
        }
    }
    if let Some(home) = home {
        return try_load_auth(&home.join(".composer").join("auth.json"));
    }
    Ok(None)
}

fn try_load_auth(path: &Path) -> Result<Option<AuthConfig>> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let ac: AuthConfig = serde_json::from_slice(&data)
        .map_err(|e| CorediffError::composer(format!("parsing {}: {e}", path.display())))?;
    Ok(Some(ac))
}

/// Search for composer-type repositories in a Composer config.json,
/// walking from the current working directory upward, then
/// `$HOME/.composer/config.json`. Returns an empty list when none found.
pub fn find_config_repos() -> Result<Vec<Repository>> {
    let cwd = std::env::current_dir()?;
    find_config_repos_from(&cwd, dirs::home_dir())
}

pub fn find_config_repos_from(start: &Path, home: Option<PathBuf>) -> Result<Vec<Repository>> {
    for dir in start.ancestors() {
        let repos = try_load_config_repos(&dir.join(".composer").join("config.json"))?;
        if !repos.is_empty() {
            return Ok(repos);
        }
    }
    if let Some(home) = home {
        return try_load_config_repos(&home.join(".composer").join("config.json"));
    }
    Ok(Vec::new())
}

fn try_load_config_repos(path: &Path) -> Result<Vec<Repository>> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    parse_repos(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repos_object_form() {
        let json = br#"{
            "repositories": {
                "magento": {"type": "composer", "url": "https://repo.magento.com/"},
                "local": {"type": "path", "url": "../local"}
            }
        }"#;
        let repos = parse_repos(json).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].url, "https://repo.magento.com");
    }

    #[test]
    fn test_parse_repos_array_form() {
        let json = br#"{
            "repositories": [
                {"type": "composer", "url": "https://mirror.example.org/packages.json"},
                {"type": "vcs", "url": "https://github.com/foo/bar"}
            ]
        }"#;
        let repos = parse_repos(json).unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(repos[0].url, "https://mirror.example.org");
    }

    #[test]
    fn test_parse_repos_missing_section() {
        assert!(parse_repos(br#"{"name": "acme/site"}"#).unwrap().is_empty());
    }

    #[test]
    fn test_normalize_repo_url() {
        assert_eq!(
            normalize_repo_url("https://repo.example.com/packages.json"),
            "https://repo.example.com"
        );
        assert_eq!(normalize_repo_url("https://repo.example.com///"), "https://repo.example.com");
        assert_eq!(normalize_repo_url("https://repo.example.com"), "https://repo.example.com");
    }

    #[test]
    fn test_parse_lock_filters_platform_and_meta() {
        let json = br#"{
            "packages": [
                {"name": "psr/log", "version": "1.1.4"},
                {"name": "php", "version": ">=8.1"},
                {"name": "ext-json", "version": "*"},
                {"name": "magento/product-community-edition", "version": "2.4.7", "type": "metapackage"}
            ],
            "packages-dev": [
                {"name": "phpunit/phpunit", "version": "9.6.0"}
            ]
        }"#;
        let pkgs = parse_lock_packages(json).unwrap();
        assert_eq!(pkgs.len(), 1);
        assert_eq!(pkgs[0].name, "psr/log");
    }

    #[test]
    fn test_parse_replace_requires_single_slash() {
        let json = br#"{
            "replace": {
                "magento/module-catalog": "*",
                "not-a-package": "*",
                "too/many/slashes": "*"
            }
        }"#;
        let replaces = parse_replace(json).unwrap();
        assert_eq!(replaces, vec!["magento/module-catalog"]);
    }

    #[test]
    fn test_parse_name_and_version() {
        let json = br#"{"name": "magento/module-catalog", "version": "104.0.7"}"#;
        assert_eq!(parse_name(json), "magento/module-catalog");
        assert_eq!(parse_version(json), "104.0.7");
        assert_eq!(parse_name(b"not json"), "");
        assert_eq!(parse_version(br#"{"name": "a/b"}"#), "");
    }

    #[test]
    fn test_auth_config_parsing_and_header() {
        let json = br#"{
            "http-basic": {"repo.magento.com": {"username": "key", "password": "secret"}},
            "bearer": {"pkg.example.com": "tok123"},
            "github-oauth": {"github.com": "gho_abc"}
        }"#;
        let ac: AuthConfig = serde_json::from_slice(json).unwrap();

        assert_eq!(
            ac.authorization_for("repo.magento.com").unwrap(),
            format!("Basic {}", {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD.encode("key:secret")
            })
        );
        assert_eq!(ac.authorization_for("pkg.example.com").unwrap(), "Bearer tok123");
        assert_eq!(ac.authorization_for("github.com").unwrap(), "token gho_abc");
        assert!(ac.authorization_for("other.example.com").is_none());
        assert_eq!(ac.hosts().len(), 3);
    }

    #[test]
    fn test_find_auth_walks_upward() {
        let dir = tempfile::TempDir::new().unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        let auth_dir = dir.path().join("a").join(".composer");
        std::fs::create_dir_all(&auth_dir).unwrap();
        std::fs::write(
            auth_dir.join("auth.json"),
            br#"{"bearer": {"example.com": "t"}}"#,
        )
        .unwrap();

        let found = find_auth_config_from(&nested, None).unwrap().unwrap();
        assert!(found.authorization_for("example.com").is_some());

        let none = find_auth_config_from(dir.path(), None).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn test_find_auth_falls_back_to_home() {
        let dir = tempfile::TempDir::new().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(home.join(".composer")).unwrap();
        std::fs::write(
            home.join(".composer/auth.json"),
            br#"{"bearer": {"example.com": "t"}}"#,
        )
        .unwrap();
        let start = dir.path().join("elsewhere");
        std::fs::create_dir_all(&start).unwrap();

        let found = find_auth_config_from(&start, Some(home)).unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_parse_project_appends_packagist() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("composer.json"),
            br#"{"repositories": [{"type": "composer", "url": "https://repo.magento.com"}]}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("composer.lock"),
            br#"{"packages": [{"name": "psr/log", "version": "1.1.4"}]}"#,
        )
        .unwrap();

        let proj = parse_project(&dir.path().join("composer.json")).unwrap();
        assert_eq!(proj.repos.len(), 2);
        assert_eq!(proj.repos[1].url, PACKAGIST_URL);
        assert_eq!(proj.packages.len(), 1);
    }
}
