//! `patchwright check-tools` — validate bundles without starting a run.

use std::path::PathBuf;

use clap::Args;

use patchwright_tools::{Bundle, BundleRef, Catalog, ToolConfig};

#[derive(Args)]
pub struct CheckToolsArgs {
    /// Bundle directory to validate; repeatable
    #[arg(short, long = "bundle", required = true)]
    bundles: Vec<PathBuf>,
}

pub fn run(args: CheckToolsArgs) -> anyhow::Result<()> {
    let mut failures = 0usize;
    let mut references = Vec::new();
    for dir in &args.bundles {
        let reference = BundleRef::new(dir);
        match Bundle::load(&reference) {
            Ok(bundle) => {
                let commands: Vec<&str> = bundle.commands().map(|c| c.name.as_str()).collect();
                println!(
                    "ok    {} ({} commands: {})",
                    dir.display(),
                    commands.len(),
                    commands.join(", ")
                );
                references.push(reference);
            }
            Err(err) => {
                failures += 1;
                println!("error {}: {err}", dir.display());
            }
        }
    }

    // Cross-bundle checks (duplicate names, pattern compilation) only make
    // sense once every bundle loads on its own.
    if failures == 0 {
        let config = ToolConfig {
            bundles: references,
            ..ToolConfig::default()
        };
        if let Err(err) = Catalog::build(config) {
            failures += 1;
            println!("error: {err}");
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} bundle validation failure(s)");
    }
    println!("all bundles are valid");
    Ok(())
}
