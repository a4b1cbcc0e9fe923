//! `parley doctor`: diagnose the local setup.

use parley_config::AppConfig;
use parley_extensions::discover;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    println!("🩺 Parley Doctor: System Diagnostics");
    println!("====================================\n");

    let mut issues = 0;

    let config_path = AppConfig::config_path();
    if !config_path.exists() {
        println!("  ⚠️  No config file, using defaults. Run `parley onboard` to create one");
        issues += 1;
    }

    let config = match AppConfig::load() {
        Ok(config) => {
            println!("  ✅ Config valid");
            config
        }
        Err(e) => {
            println!("  ❌ Config invalid: {e}");
            println!("\n  ⚠️  Fix the config before running further checks.");
            return Ok(());
        }
    };

    let root = config.extension_root();
    if root.is_dir() {
        let discovery = discover(&root);
        println!(
            "  ✅ Extension root: {} ({} manifest(s))",
            root.display(),
            discovery.descriptors.len()
        );
        for error in &discovery.errors {
            println!("  ❌ {error}");
            issues += 1;
        }
    } else {
        println!("  ⚠️  No extension root at {}. Run `parley onboard`", root.display());
        issues += 1;
    }

    let data_dir = config.data_dir();
    if data_dir.is_dir() {
        let probe = data_dir.join(".doctor");
        match std::fs::write(&probe, b"ok").and_then(|_| std::fs::remove_file(&probe)) {
            Ok(()) => println!("  ✅ Data directory writable: {}", data_dir.display()),
            Err(e) => {
                println!("  ❌ Data directory not writable: {e}");
                issues += 1;
            }
        }
    } else {
        println!("  ⚠️  No data directory at {}. Run `parley onboard`", data_dir.display());
        issues += 1;
    }

    println!();
    if issues == 0 {
        println!("  🎉 All checks passed!");
    } else {
        println!("  ⚠️  {issues} issue(s) found. See above for details.");
    }

    Ok(())
}
