//! `parley run`: boot the runtime and serve until interrupted.

use parley::builtin;
use parley_config::AppConfig;
use parley_extensions::{Runtime, RuntimeOptions};

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::load()?;
    std::fs::create_dir_all(config.data_dir())?;

    let storage_path = config.storage_path();
    let backend =
        parley_store::open(&config.storage.backend, &storage_path.to_string_lossy()).await?;

    println!("Parley v{}", env!("CARGO_PKG_VERSION"));
    println!("========================================");
    println!("  Profile:    {}", config.profile.name);
    println!("  Storage:    {} ({})", config.storage.backend, storage_path.display());
    println!("  Extensions: {}", config.extension_root().display());
    println!("========================================\n");

    let runtime = Runtime::boot(
        backend,
        builtin::catalog()?,
        RuntimeOptions::from_config(&config),
    )
    .await?;

    let report = runtime.report();
    println!("  Loaded: {}", report.loaded.join(", "));
    for failure in &report.failures {
        println!("  ❌ {failure}");
    }
    println!("\n  Type a message. Lines starting with `!echo ` are echoed back.");
    println!("  Press Ctrl+C or Ctrl+D to stop.\n");

    // Handler failures are logged by the dispatcher itself.
    let shutdown = runtime.core().shutdown.clone();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            println!("\n🛑 Shutting down...");
        }
        _ = shutdown.cancelled() => {
            println!("\n🛑 Input closed, shutting down...");
        }
    }

    let report = runtime.shutdown().await;
    println!(
        "  Drained {} event(s), dropped {}, aborted {} action(s).",
        report.drained, report.dropped, report.aborted_actions
    );
    println!("👋 Goodbye!");

    Ok(())
}
