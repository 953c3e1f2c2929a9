//! Tool bundles: directories of commands installed into the sandbox.
//!
//! A bundle is a directory holding a `bundle.toml` manifest (command
//! definitions plus an optional state command) and a `bin/` directory of
//! implementation files. How a `bin/` file is installed is decided
//! entirely by its content and name, at load time:
//!
//! - starts with `#!`          -> executable script, invocable by file stem
//! - `.sh` without a shebang   -> sourced into the session shell
//! - `_` prefix                -> utility, uploaded but never invoked
//!
//! Anything else is a configuration error. Runtime never has to guess.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use patchwright_core::error::ConfigError;

use crate::command::Command;

/// How one `bin/` file is wired into the sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallKind {
    /// Executable with a shebang; `chmod +x` and invoked by name.
    Script,
    /// Shell fragment sourced into the persistent session.
    Sourced,
    /// Support file commands rely on; uploaded only.
    Utility,
}

/// One classified file under a bundle's `bin/`.
#[derive(Debug, Clone)]
pub struct BundleFile {
    pub name: String,
    pub kind: InstallKind,
}

/// The parsed `bundle.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BundleManifest {
    #[serde(default)]
    pub commands: Vec<Command>,

    /// Shell snippet whose stdout must be a flat JSON object describing
    /// the current sandbox state.
    #[serde(default)]
    pub state_command: Option<String>,
}

/// Reference to a bundle directory inside a tool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleRef {
    pub path: PathBuf,

    /// Commands loaded but left out of docs, schemas, and the catalog.
    #[serde(default)]
    pub hidden_tools: Vec<String>,
}

impl BundleRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            hidden_tools: Vec::new(),
        }
    }
}

/// A fully loaded and validated bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub path: PathBuf,
    pub manifest: BundleManifest,
    pub files: Vec<BundleFile>,
    hidden_tools: Vec<String>,
}

impl Bundle {
    /// Loads and validates the bundle at `reference.path`.
    pub fn load(reference: &BundleRef) -> Result<Self, ConfigError> {
        let path = &reference.path;
        let invalid = |reason: String| ConfigError::InvalidBundle {
            path: path.display().to_string(),
            reason,
        };
        if !path.is_dir() {
            return Err(invalid("bundle path is not a directory".into()));
        }

        let manifest_path = path.join("bundle.toml");
        let raw = std::fs::read_to_string(&manifest_path).map_err(|source| ConfigError::Io {
            path: manifest_path.display().to_string(),
            source,
        })?;
        let manifest: BundleManifest =
            toml::from_str(&raw).map_err(|err| invalid(format!("invalid bundle.toml: {err}")))?;

        for command in &manifest.commands {
            command.validate()?;
        }
        let known: Vec<&str> = manifest
            .commands
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        for hidden in &reference.hidden_tools {
            if !known.contains(&hidden.as_str()) {
                return Err(invalid(format!(
                    "hidden tool '{hidden}' is not defined in bundle.toml"
                )));
            }
        }

        let files = classify_bin_dir(path)?;
        Ok(Self {
            path: path.clone(),
            manifest,
            files,
            hidden_tools: reference.hidden_tools.clone(),
        })
    }

    /// Directory name used as the install target under the tool root.
    pub fn dir_name(&self) -> &str {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("bundle")
    }

    /// The bundle's commands, hidden ones excluded.
    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.manifest
            .commands
            .iter()
            .filter(|c| !self.hidden_tools.contains(&c.name))
    }

    pub fn state_command(&self) -> Option<&str> {
        self.manifest.state_command.as_deref()
    }

    /// Files to source into the session shell after upload.
    pub fn sourced_files(&self) -> impl Iterator<Item = &BundleFile> {
        self.files
            .iter()
            .filter(|f| f.kind == InstallKind::Sourced)
    }

    /// Whether the bundle ships a one-off `install.sh` setup script.
    pub fn has_install_script(&self) -> bool {
        self.path.join("install.sh").is_file()
    }
}

/// Classifies every regular file under `bin/`. A missing `bin/` is fine;
/// a file that fits no category is a fatal load error.
fn classify_bin_dir(bundle_path: &Path) -> Result<Vec<BundleFile>, ConfigError> {
    let bin = bundle_path.join("bin");
    if !bin.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    let entries = std::fs::read_dir(&bin).map_err(|source| ConfigError::Io {
        path: bin.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| ConfigError::Io {
            path: bin.display().to_string(),
            source,
        })?;
        if !entry.path().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let content = std::fs::read(entry.path()).map_err(|source| ConfigError::Io {
            path: entry.path().display().to_string(),
            source,
        })?;
        let kind = classify_file(&name, &content).ok_or_else(|| ConfigError::InvalidBundle {
            path: bundle_path.display().to_string(),
            reason: format!(
                "bin/{name} is neither a script (shebang), a sourced file (.sh), \
                 nor a utility (underscore prefix)"
            ),
        })?;
        files.push(BundleFile { name, kind });
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn classify_file(name: &str, content: &[u8]) -> Option<InstallKind> {
    if content.starts_with(b"#!") {
        Some(InstallKind::Script)
    } else if name.ends_with(".sh") {
        Some(InstallKind::Sourced)
    } else if name.starts_with('_') {
        Some(InstallKind::Utility)
    } else {
        None
    }
}
