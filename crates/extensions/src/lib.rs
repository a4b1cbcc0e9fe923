//! Extensions for Parley: manifests, dependency resolution, loading, and
//! the runtime that ties the core services together.
//!
//! ```text
//! discover(root) ─▶ partition ─▶ Loader::load_all ─▶ start_all ─▶ Ready
//! ```

pub mod catalog;
pub mod context;
pub mod loader;
pub mod manifest;
pub mod resolve;
pub mod runtime;

pub use catalog::{Catalog, Extension, ExtensionFactory};
pub use context::{CORE_SOURCE, CoreContext, ExtensionContext};
pub use loader::{ExtensionFailure, LoadReport, LoadedExtension, Loader};
pub use manifest::{CapabilityDecl, Discovery, ExtensionDescriptor, MANIFEST_FILE, discover, overlay};
pub use resolve::{Partition, ResolvedExtension, partition, resolve_order};
pub use runtime::{Runtime, RuntimeOptions};
