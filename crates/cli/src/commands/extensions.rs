//! `parley extensions`: list discovered manifests and the load order.

use parley::builtin;
use parley_config::AppConfig;
use parley_extensions::{discover, overlay, resolve_order};
use std::path::PathBuf;

pub async fn run(root: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    let root = root.unwrap_or_else(|| config.extension_root());

    println!("Extensions in {}", root.display());
    println!("========================================\n");

    let catalog = builtin::catalog()?;
    let mut descriptors = catalog.bundled_descriptors().to_vec();
    let discovery = discover(&root);
    overlay(&mut descriptors, discovery.descriptors);
    descriptors.retain(|d| config.is_enabled(&d.name));

    for descriptor in &descriptors {
        let origin = match &descriptor.path {
            Some(path) => path.display().to_string(),
            None => "built-in".into(),
        };
        println!("  📦 {} v{} ({origin})", descriptor.name, descriptor.version);
        println!("     {}", descriptor.summary);
        if !descriptor.implements.is_empty() {
            println!("     implements: {}", descriptor.implements.join(", "));
        }
        for (name, requirement) in &descriptor.dependencies {
            println!("     requires {name} {requirement}");
        }
        for (name, requirement) in &descriptor.optional_dependencies {
            println!("     after {name} {requirement} (optional)");
        }
        for capability in &descriptor.capabilities {
            println!(
                "     {} {} v{}",
                capability.kind, capability.name, capability.version
            );
        }
    }

    for error in &discovery.errors {
        println!("  ❌ {error}");
    }

    println!();
    match resolve_order(&descriptors) {
        Ok(order) => {
            println!("  Load order:");
            for (i, resolved) in order.iter().enumerate() {
                println!(
                    "  {:>3}. {} (generation {})",
                    i + 1,
                    resolved.name(),
                    resolved.generation
                );
            }
        }
        Err(e) => println!("  ❌ Cannot resolve load order: {e}"),
    }

    Ok(())
}
