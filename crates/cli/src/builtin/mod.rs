//! Extensions compiled into the binary.
//!
//! - `console`: a platform bound to the local terminal
//! - `echo`: replies with whatever follows its command prefix

pub mod console;
pub mod echo;

pub use console::{Console, ConsoleIo};
pub use echo::Echo;

use parley_core::error::LoadError;
use parley_extensions::{Catalog, ExtensionDescriptor};

const CONSOLE_MANIFEST: &str = include_str!("manifests/console.toml");
const ECHO_MANIFEST: &str = include_str!("manifests/echo.toml");

/// The built-in catalog, with the console attached to the terminal.
pub fn catalog() -> Result<Catalog, LoadError> {
    catalog_with(ConsoleIo::Terminal)
}

/// The built-in catalog with a custom console transport.
pub fn catalog_with(io: ConsoleIo) -> Result<Catalog, LoadError> {
    let console = ExtensionDescriptor::from_toml(CONSOLE_MANIFEST, "builtin:console")?;
    let echo = ExtensionDescriptor::from_toml(ECHO_MANIFEST, "builtin:echo")?;

    Ok(Catalog::new()
        .bundled(console, move || Box::new(Console::new(io.clone())))
        .bundled(echo, || Box::new(Echo)))
}
