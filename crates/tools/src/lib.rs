//! Command definitions, tool bundles, and the action catalog for
//! Patchwright.
//!
//! Tools are what the model is allowed to do inside the sandbox. They are
//! declared in bundle directories on disk, validated and compiled into a
//! [`catalog::Catalog`] at startup, and installed into the persistent
//! shell session before the first step. The catalog also owns the safety
//! blocklist, heredoc guarding for multi-line commands, the sandbox state
//! probe, and the documentation block substituted into prompts.

pub mod bundle;
pub mod catalog;
pub mod command;

pub use bundle::{Bundle, BundleFile, BundleManifest, BundleRef, InstallKind};
pub use catalog::{Catalog, FilterConfig, ToolConfig};
pub use command::{Argument, Command};
