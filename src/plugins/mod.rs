// Extension contract and the resolvers that turn files into modules:
// - api: traits extension authors implement
// - capability: structural check applied to every exported type
// - lua: sandboxed Lua scripts
// - dylib + native: Rust cdylibs loaded with libloading
pub mod api;
pub mod capability;
pub mod dylib;
pub mod lua;
pub mod module;
pub mod native;

pub use api::{callback, CommandCallback, Construct, Extension, ExtensionArgs, Handler, Params};
pub use capability::{Nonconformance, Shape};
pub use dylib::DylibResolver;
pub use lua::LuaResolver;
pub use module::{ExtensionModule, ExtensionSource, ExtensionType, ModuleResolver, NativeType};
pub use native::ExtensionRegistrar;
