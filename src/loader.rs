//! Whitelisted module loader.
//!
//! Guest code may only load modules by bare name if that name appears in the
//! module whitelist fixed at sandbox construction; whitelisted names resolve
//! under the dist directory's `node_modules`. Relative imports between
//! resolved files stay confined to the dist root. Blocks all network access,
//! filesystem escape, and restricts to .js/.mjs files.

use deno_core::{
    anyhow::{anyhow, Error},
    ModuleLoadResponse, ModuleLoader, ModuleSource, ModuleSourceCode, ModuleSpecifier,
    ModuleType, RequestedModuleType, ResolutionKind,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::RenderError;

/// A module loader gated on a fixed whitelist of module names.
///
/// Security guarantees:
/// - Bare specifiers outside the whitelist are rejected with
///   [`RenderError::ModuleNotWhitelisted`]
/// - No network access (http/https URLs rejected)
/// - No filesystem escape (path traversal blocked via canonicalization)
/// - Only .js and .mjs files allowed
/// - Dynamic imports supported but gated identically
pub struct WhitelistLoader {
    dist_root: PathBuf,
    whitelist: HashSet<String>,
}

impl WhitelistLoader {
    /// Create a loader rooted at `dist_root` with the given module whitelist.
    /// The whitelist is fixed here and never mutated afterward.
    pub fn new(
        dist_root: impl AsRef<Path>,
        whitelist: impl IntoIterator<Item = String>,
    ) -> Result<Self, Error> {
        let canonical = dist_root
            .as_ref()
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize dist_root: {}", e))?;

        if !canonical.is_dir() {
            return Err(anyhow!("dist_root must be a directory"));
        }

        Ok(Self {
            dist_root: canonical,
            whitelist: whitelist.into_iter().collect(),
        })
    }

    /// Check if a path is within the dist root.
    /// Uses canonicalization to resolve symlinks and prevent traversal.
    fn is_path_allowed(&self, path: &Path) -> bool {
        match path.canonicalize() {
            Ok(canonical) => canonical.starts_with(&self.dist_root),
            Err(_) => false,
        }
    }

    /// Validate file extension is allowed (.js or .mjs only)
    fn is_extension_allowed(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("js") | Some("mjs")
        )
    }

    /// Map a whitelisted module name to its file under `node_modules`.
    ///
    /// A directory resolves to its `index.js`; a bare name without an
    /// extension resolves to `<name>.js`.
    fn whitelisted_module_path(&self, name: &str) -> PathBuf {
        let base = self.dist_root.join("node_modules").join(name);
        if base.is_dir() {
            base.join("index.js")
        } else if base.extension().is_some() {
            base
        } else {
            base.with_extension("js")
        }
    }
}

impl ModuleLoader for WhitelistLoader {
    fn resolve(
        &self,
        specifier: &str,
        referrer: &str,
        _kind: ResolutionKind,
    ) -> Result<ModuleSpecifier, Error> {
        // Block all remote URLs
        if specifier.starts_with("http://")
            || specifier.starts_with("https://")
            || specifier.starts_with("data:")
            || specifier.starts_with("blob:")
        {
            return Err(anyhow!("Remote imports are forbidden: {}", specifier));
        }

        // Resolve the specifier
        let resolved = if specifier.starts_with("./") || specifier.starts_with("../") {
            // Relative import - resolve against referrer
            let referrer_url = ModuleSpecifier::parse(referrer)
                .map_err(|e| anyhow!("Invalid referrer '{}': {}", referrer, e))?;
            referrer_url
                .join(specifier)
                .map_err(|e| anyhow!("Failed to resolve '{}': {}", specifier, e))?
        } else if specifier.starts_with("file://") {
            // Absolute file URL
            ModuleSpecifier::parse(specifier)
                .map_err(|e| anyhow!("Invalid file URL '{}': {}", specifier, e))?
        } else if specifier.starts_with('/') {
            // Absolute path - convert to file URL
            ModuleSpecifier::from_file_path(specifier)
                .map_err(|_| anyhow!("Invalid absolute path: {}", specifier))?
        } else {
            // Bare specifier - this is the whitelist gate
            if !self.whitelist.contains(specifier) {
                return Err(RenderError::module_not_whitelisted(specifier).into());
            }
            ModuleSpecifier::from_file_path(self.whitelisted_module_path(specifier))
                .map_err(|_| anyhow!("Invalid module name: {}", specifier))?
        };

        // Ensure it's a file:// URL
        if resolved.scheme() != "file" {
            return Err(anyhow!(
                "Only file:// URLs allowed, got: {}",
                resolved.scheme()
            ));
        }

        // Get the filesystem path
        let path = resolved
            .to_file_path()
            .map_err(|_| anyhow!("Failed to convert URL to path: {}", resolved))?;

        // Security check: path must be within the dist root
        if !self.is_path_allowed(&path) {
            return Err(anyhow!(
                "Access denied: '{}' is outside the dist directory",
                path.display()
            ));
        }

        // Extension check
        if !Self::is_extension_allowed(&path) {
            return Err(anyhow!(
                "Only .js and .mjs files allowed, got: {}",
                path.display()
            ));
        }

        Ok(resolved)
    }

    fn load(
        &self,
        module_specifier: &ModuleSpecifier,
        _maybe_referrer: Option<&ModuleSpecifier>,
        _is_dyn_import: bool,
        _requested_module_type: RequestedModuleType,
    ) -> ModuleLoadResponse {
        let specifier = module_specifier.clone();

        // Convert to path
        let path = match specifier.to_file_path() {
            Ok(p) => p,
            Err(_) => {
                return ModuleLoadResponse::Sync(Err(anyhow!("Invalid file path: {}", specifier)));
            }
        };

        // Defense in depth: re-check path is allowed
        if !self.is_path_allowed(&path) {
            return ModuleLoadResponse::Sync(Err(anyhow!("Access denied: {}", path.display())));
        }

        // Defense in depth: re-check extension
        if !Self::is_extension_allowed(&path) {
            return ModuleLoadResponse::Sync(Err(anyhow!(
                "Invalid extension: {}",
                path.display()
            )));
        }

        // Load the file content
        let code = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return ModuleLoadResponse::Sync(Err(anyhow!(
                    "Failed to read '{}': {}",
                    path.display(),
                    e
                )));
            }
        };

        ModuleLoadResponse::Sync(Ok(ModuleSource::new(
            ModuleType::JavaScript,
            ModuleSourceCode::String(code.into()),
            &specifier,
            None,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader_with(dir: &Path, whitelist: &[&str]) -> WhitelistLoader {
        WhitelistLoader::new(dir, whitelist.iter().map(|s| s.to_string())).unwrap()
    }

    #[test]
    fn test_blocks_remote_urls() {
        let dir = tempdir().unwrap();
        let loader = loader_with(dir.path(), &[]);

        let result = loader.resolve(
            "https://evil.com/payload.js",
            "file:///test.js",
            ResolutionKind::Import,
        );
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Remote imports are forbidden"));
    }

    #[test]
    fn test_rejects_module_outside_whitelist() {
        let dir = tempdir().unwrap();
        let loader = loader_with(dir.path(), &["allowed-module"]);

        let result = loader.resolve("left-pad", "file:///entry.js", ResolutionKind::Import);
        let err = result.unwrap_err();
        let kind = err
            .downcast_ref::<RenderError>()
            .expect("should carry a typed whitelist error");
        assert!(matches!(
            kind,
            RenderError::ModuleNotWhitelisted { module } if module == "left-pad"
        ));
    }

    #[test]
    fn test_resolves_whitelisted_module() {
        let dir = tempdir().unwrap();
        let module_dir = dir.path().join("node_modules").join("my-module");
        fs::create_dir_all(&module_dir).unwrap();
        fs::write(module_dir.join("index.js"), "export default 1;").unwrap();
        let loader = loader_with(dir.path(), &["my-module"]);

        let result = loader.resolve("my-module", "file:///entry.js", ResolutionKind::Import);
        let specifier = result.unwrap();
        assert!(specifier.path().ends_with("node_modules/my-module/index.js"));
    }

    #[test]
    fn test_resolves_whitelisted_single_file_module() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/flat.js"), "export default 1;").unwrap();
        let loader = loader_with(dir.path(), &["flat"]);

        let result = loader.resolve("flat", "file:///entry.js", ResolutionKind::Import);
        assert!(result.unwrap().path().ends_with("node_modules/flat.js"));
    }

    #[test]
    fn test_blocks_path_traversal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("test.js"), "export default 1;").unwrap();
        let loader = loader_with(dir.path(), &[]);

        let entry = format!("file://{}/test.js", dir.path().display());
        let result = loader.resolve("../../../etc/passwd", &entry, ResolutionKind::Import);
        assert!(result.is_err());
    }

    #[test]
    fn test_allows_relative_imports_inside_dist() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("chunk.js"), "export default 1;").unwrap();
        let loader = loader_with(dir.path(), &[]);

        let entry = format!("file://{}/entry.js", dir.path().display());
        let result = loader.resolve("./chunk.js", &entry, ResolutionKind::Import);
        assert!(result.is_ok());
    }

    #[test]
    fn test_blocks_non_js_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.json"), "{}").unwrap();
        let loader = loader_with(dir.path(), &[]);

        let entry = format!("file://{}/entry.js", dir.path().display());
        let result = loader.resolve("./data.json", &entry, ResolutionKind::Import);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Only .js and .mjs"));
    }
}
