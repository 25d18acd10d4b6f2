//! Packaging manifest loading.
//!
//! A dist directory produced by the application build carries a
//! `package.json` with an `ssr` section naming the vendor bundle, the
//! application bundle, the base HTML template, and the module/host
//! whitelists:
//!
//! ```json
//! {
//!   "ssr": {
//!     "manifest": {
//!       "appFile": "app.js",
//!       "vendorFile": "vendor.js",
//!       "htmlFile": "index.html"
//!     },
//!     "moduleWhitelist": ["rsvp"],
//!     "hostWhitelist": ["https://api.example.com"]
//!   }
//! }
//! ```
//!
//! Malformed or missing manifest data is a construction-time failure, not a
//! per-request one.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ManifestError;

#[derive(Debug, Deserialize)]
struct PackageJson {
    ssr: Option<SsrSection>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SsrSection {
    manifest: FileManifest,
    #[serde(default)]
    module_whitelist: Vec<String>,
    #[serde(default)]
    host_whitelist: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileManifest {
    app_file: PathBuf,
    vendor_file: PathBuf,
    html_file: PathBuf,
}

/// A validated packaging manifest with all file paths resolved against the
/// dist root.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// The dist directory the manifest was read from.
    pub dist_path: PathBuf,
    /// Path of the application bundle.
    pub app_file: PathBuf,
    /// Path of the vendor bundle.
    pub vendor_file: PathBuf,
    /// Path of the base HTML template.
    pub html_file: PathBuf,
    /// Module names guest code may resolve.
    pub module_whitelist: Vec<String>,
    /// Origins guest code may fetch from.
    pub host_whitelist: Vec<String>,
}

impl Manifest {
    /// Read and validate the manifest inside `dist_path`.
    pub fn load(dist_path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let dist_path = dist_path.as_ref();
        let pkg_path = dist_path.join("package.json");

        let raw = fs::read_to_string(&pkg_path).map_err(|source| ManifestError::Unreadable {
            path: pkg_path.clone(),
            source,
        })?;

        let pkg: PackageJson =
            serde_json::from_str(&raw).map_err(|source| ManifestError::Malformed {
                path: pkg_path.clone(),
                source,
            })?;

        let section = pkg.ssr.ok_or(ManifestError::MissingSection {
            path: pkg_path.clone(),
        })?;

        Ok(Self {
            dist_path: dist_path.to_path_buf(),
            app_file: dist_path.join(section.manifest.app_file),
            vendor_file: dist_path.join(section.manifest.vendor_file),
            html_file: dist_path.join(section.manifest.html_file),
            module_whitelist: section.module_whitelist,
            host_whitelist: section.host_whitelist,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_loads_complete_manifest() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{
                "name": "basic-app",
                "ssr": {
                    "manifest": {
                        "appFile": "app.js",
                        "vendorFile": "vendor.js",
                        "htmlFile": "index.html"
                    },
                    "moduleWhitelist": ["rsvp"],
                    "hostWhitelist": ["http://localhost:1234"]
                }
            }"#,
        )
        .unwrap();

        let manifest = Manifest::load(dir.path()).unwrap();
        assert_eq!(manifest.app_file, dir.path().join("app.js"));
        assert_eq!(manifest.vendor_file, dir.path().join("vendor.js"));
        assert_eq!(manifest.html_file, dir.path().join("index.html"));
        assert_eq!(manifest.module_whitelist, vec!["rsvp".to_string()]);
        assert_eq!(
            manifest.host_whitelist,
            vec!["http://localhost:1234".to_string()]
        );
    }

    #[test]
    fn test_whitelists_default_to_empty() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"ssr": {"manifest": {"appFile": "a.js", "vendorFile": "v.js", "htmlFile": "i.html"}}}"#,
        )
        .unwrap();

        let manifest = Manifest::load(dir.path()).unwrap();
        assert!(manifest.module_whitelist.is_empty());
        assert!(manifest.host_whitelist.is_empty());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempdir().unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Unreadable { .. }));
        assert!(err.to_string().contains("package.json"));
    }

    #[test]
    fn test_malformed_json() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), "{not json").unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::Malformed { .. }));
    }

    #[test]
    fn test_missing_section() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("package.json"), r#"{"name": "plain-app"}"#).unwrap();
        let err = Manifest::load(dir.path()).unwrap_err();
        assert!(matches!(err, ManifestError::MissingSection { .. }));
        assert!(err.to_string().contains("`ssr` section"));
    }
}
