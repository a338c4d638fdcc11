//! Kiln - a fault-isolating extension loader
//!
//! Kiln scans a directory for extension modules, instantiates every
//! extension type they export with its own configuration section, runs
//! each one's `setup` hook and registers its handlers as commands. A broken
//! file, type or handler is logged and skipped without affecting the rest.
//!
//! # Modules
//!
//! - [`config`]: Host configuration and serialization
//! - [`error`]: Error types for each pipeline stage
//! - [`loader`]: Directory scanning, instantiation, lifecycle and registration
//! - [`plugins`]: Extension traits and the Lua and native module resolvers
//! - [`registry`]: Command registry and sync sinks
//! - [`settings`]: Per-extension configuration sections

pub mod config;
pub mod error;
pub mod loader;
pub mod plugins;
pub mod registry;
pub mod settings;

pub use error::{Cancelled, LoadError, ResolveError};
pub use loader::{LoadContext, LoadReport, Loader, Supervisor};
pub use plugins::{Construct, Extension, ExtensionArgs, ExtensionModule, Handler};
pub use registry::{Command, CommandRegistry, CommandTree, Scope};
