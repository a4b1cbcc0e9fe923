//! `parley onboard`: first-time setup.

use parley_config::AppConfig;

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config_dir = AppConfig::config_dir();
    let config_path = AppConfig::config_path();

    println!("Parley: First-Time Setup");
    println!("========================\n");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
        println!("✅ Created config directory: {}", config_dir.display());
    } else {
        println!("  Config directory exists: {}", config_dir.display());
    }

    if config_path.exists() {
        println!("\n⚠️  Config already exists at: {}", config_path.display());
        println!("   Edit it manually or delete and re-run onboard.\n");
    } else {
        std::fs::write(&config_path, AppConfig::default_toml())?;
        println!("✅ Created config.toml at: {}", config_path.display());
    }

    // Directories follow the (possibly pre-existing) config.
    let config = AppConfig::load()?;
    for (label, dir) in [
        ("extension root", config.extension_root()),
        ("data directory", config.data_dir()),
    ] {
        if dir.exists() {
            println!("  {label} exists: {}", dir.display());
        } else {
            std::fs::create_dir_all(&dir)?;
            println!("✅ Created {label}: {}", dir.display());
        }
    }

    println!("\n📝 Next steps:");
    println!(
        "   1. Drop extension directories (each with a manifest.toml) into {}",
        config.extension_root().display()
    );
    println!("   2. Run: parley extensions");
    println!("   3. Run: parley run\n");

    Ok(())
}
