//! Module manifest schema and validation.
//!
//! Every build module is declared by a `kiln.yaml` colocated with its
//! sources. The manifest names the image to build, where its recipe and
//! context live, and which sibling modules must be built first. Fields this
//! crate does not read are ignored so embedders can extend the file.

use crate::error::{KilnError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Fixed manifest file name, looked up relative to each module directory.
pub const MANIFEST_NAME: &str = "kiln.yaml";

/// Default recipe file name when `build.dockerfile` is not set.
pub const DEFAULT_RECIPE: &str = "Dockerfile";

/// A parsed `kiln.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    /// Directories (relative to this manifest) containing dependency modules.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Image build declaration. A manifest without one is a pure aggregation
    /// module that only builds its dependencies.
    #[serde(default)]
    pub build: Option<BuildSpec>,
}

/// The `build` block of a manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Image name, e.g. `test/foo`. Required when the block is present.
    #[serde(default)]
    pub name: String,
    /// Recipe file path relative to the module directory.
    #[serde(default)]
    pub dockerfile: String,
    /// Build context directory relative to the module directory.
    #[serde(default)]
    pub context: String,
    /// Optional multi-stage target.
    #[serde(default)]
    pub target: String,
    /// Build arguments handed to the image engine.
    #[serde(default, rename = "buildArgs")]
    pub build_args: Vec<BuildArg>,
    /// Backend requirement: empty, `docker`, or `kaniko`.
    #[serde(default)]
    pub builder: String,
    /// Shell commands run before the build.
    #[serde(default)]
    pub before: Vec<String>,
    /// Shell commands run after the build.
    #[serde(default)]
    pub after: Vec<String>,
}

/// One `name=value` build argument.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildArg {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl Manifest {
    /// Load and parse a manifest file.
    pub fn load(path: &Path) -> Result<Self> {
        let body = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                KilnError::ManifestNotFound { path: path.to_path_buf() }
            } else {
                KilnError::io(path, e)
            }
        })?;
        serde_yaml::from_str(&body)
            .map_err(|source| KilnError::ManifestParse { path: path.to_path_buf(), source })
    }

    /// Validate the manifest against the module directory it was loaded
    /// from. Dependency paths are checked later, during graph resolution,
    /// so their errors can carry the declared position.
    pub fn validate(&self, module_dir: &Path) -> Result<()> {
        if let Some(build) = &self.build {
            build.validate(module_dir)?;
        }
        Ok(())
    }
}

impl BuildSpec {
    fn validate(&self, module_dir: &Path) -> Result<()> {
        if self.name.is_empty() {
            return Err(KilnError::MissingImageName);
        }
        match self.builder.as_str() {
            "" | "docker" | "kaniko" => {}
            other => return Err(KilnError::UnknownBuilder { name: other.to_string() }),
        }
        let recipe = self.recipe_path(module_dir);
        if !recipe.is_file() {
            return Err(KilnError::MissingRecipe { path: recipe });
        }
        Ok(())
    }

    /// Absolute, lexically-cleaned recipe file path.
    pub fn recipe_path(&self, module_dir: &Path) -> PathBuf {
        let rel = if self.dockerfile.is_empty() { DEFAULT_RECIPE } else { &self.dockerfile };
        paths::clean(&module_dir.join(rel))
    }

    /// Absolute, lexically-cleaned context directory path.
    pub fn context_path(&self, module_dir: &Path) -> PathBuf {
        let rel = if self.context.is_empty() { "." } else { &self.context };
        paths::clean(&module_dir.join(rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_full_manifest() {
        let yaml = r#"
dependencies: ["dep", "../other"]
build:
  name: test/foo
  dockerfile: subdir/Dockerfile
  context: ..
  target: builder
  buildArgs:
    - name: VERSION
      value: "1.2"
  builder: docker
  before: ["echo pre"]
  after: ["echo post"]
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.dependencies, vec!["dep", "../other"]);
        let build = manifest.build.unwrap();
        assert_eq!(build.name, "test/foo");
        assert_eq!(build.dockerfile, "subdir/Dockerfile");
        assert_eq!(build.context, "..");
        assert_eq!(build.target, "builder");
        assert_eq!(build.build_args.len(), 1);
        assert_eq!(build.build_args[0].name, "VERSION");
        assert_eq!(build.builder, "docker");
        assert_eq!(build.before, vec!["echo pre"]);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let yaml = r#"
build:
  name: test/foo
test:
  - name: extra
"#;
        let manifest: Manifest = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(manifest.build.unwrap().name, "test/foo");
    }

    #[test]
    fn test_validate_missing_image_name() {
        let dir = TempDir::new().unwrap();
        let manifest: Manifest = serde_yaml::from_str("build: {}").unwrap();
        let err = manifest.validate(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::MissingImageName));
    }

    #[test]
    fn test_validate_missing_recipe() {
        let dir = TempDir::new().unwrap();
        let manifest: Manifest = serde_yaml::from_str("build: {name: test/foo}").unwrap();
        let err = manifest.validate(dir.path()).unwrap_err();
        assert!(err.to_string().contains("missing Dockerfile"));
    }

    #[test]
    fn test_validate_unknown_builder() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM alpine:3.11.6").unwrap();
        let manifest: Manifest =
            serde_yaml::from_str("build: {name: test/foo, builder: podman}").unwrap();
        let err = manifest.validate(dir.path()).unwrap_err();
        assert!(matches!(err, KilnError::UnknownBuilder { .. }));
    }

    #[test]
    fn test_recipe_and_context_defaults() {
        let spec = BuildSpec { name: "test/foo".into(), ..Default::default() };
        assert_eq!(spec.recipe_path(Path::new("/m")), PathBuf::from("/m/Dockerfile"));
        assert_eq!(spec.context_path(Path::new("/m")), PathBuf::from("/m"));
    }

    #[test]
    fn test_context_outside_module_dir() {
        let spec = BuildSpec {
            name: "test/foo".into(),
            dockerfile: "subdir/Dockerfile".into(),
            context: "..".into(),
            ..Default::default()
        };
        assert_eq!(spec.recipe_path(Path::new("/a/m")), PathBuf::from("/a/m/subdir/Dockerfile"));
        assert_eq!(spec.context_path(Path::new("/a/m")), PathBuf::from("/a"));
    }
}
