use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use anyhow::Result;
use futures::future::LocalBoxFuture;
use libloading::{Library, Symbol};
use tracing::debug;

use super::api::{callback, Extension, ExtensionArgs, Handler};
use super::capability::Shape;
use super::module::{ExtensionModule, ExtensionSource, ExtensionType, ModuleResolver};
use super::native::{AbiVersionFn, ExtensionRegistrar, RegisterFn, ABI_SYMBOL, ABI_VERSION, REGISTER_SYMBOL};
use crate::error::ResolveError;

/// Resolves native extension libraries for the current platform
/// (`.so`, `.dylib` or `.dll`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibResolver;

impl DylibResolver {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleResolver for DylibResolver {
    fn extension(&self) -> &str {
        std::env::consts::DLL_EXTENSION
    }

    fn resolve(&self, source: &ExtensionSource) -> Result<ExtensionModule, ResolveError> {
        // Safety: loading a library runs its initializers. Only trusted
        // extension directories should be scanned.
        let library = unsafe { Library::new(&source.path)? };
        let library = Rc::new(library);

        let registrar = unsafe {
            let version: Symbol<AbiVersionFn> = library
                .get(symbol(ABI_SYMBOL).as_bytes())
                .map_err(|_| ResolveError::MissingEntryPoint(ABI_SYMBOL))?;
            let found = version();
            if found != ABI_VERSION {
                return Err(ResolveError::AbiMismatch {
                    expected: ABI_VERSION,
                    found,
                });
            }

            let register: Symbol<RegisterFn> = library
                .get(symbol(REGISTER_SYMBOL).as_bytes())
                .map_err(|_| ResolveError::MissingEntryPoint(REGISTER_SYMBOL))?;

            let mut registrar = ExtensionRegistrar::new();
            panic::catch_unwind(AssertUnwindSafe(|| register(&mut registrar)))
                .map_err(|payload| ResolveError::Panicked(crate::loader::panic_message(&*payload)))?;
            registrar
        };

        let mut module = registrar.into_module(source.name.clone());
        module.types = module
            .types
            .into_iter()
            .map(|inner| {
                Box::new(LibraryType {
                    inner,
                    library: Rc::clone(&library),
                }) as Box<dyn ExtensionType>
            })
            .collect();

        debug!(
            path = %source.path.display(),
            types = ?module.type_names(),
            "Native extension library loaded"
        );
        Ok(module)
    }
}

fn symbol(name: &str) -> String {
    format!("{name}\0")
}

// Every value produced by library code holds the library so it stays mapped
// until the last type, instance or callback is dropped. `inner` is declared
// first so it drops before `library`.

struct LibraryType {
    inner: Box<dyn ExtensionType>,
    library: Rc<Library>,
}

impl ExtensionType for LibraryType {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn shape(&self) -> Shape {
        self.inner.shape()
    }

    fn construct(&self, args: ExtensionArgs<'_>) -> Result<Rc<dyn Extension>> {
        let inner = self.inner.construct(args)?;
        Ok(Rc::new(LibraryExtension {
            inner,
            library: Rc::clone(&self.library),
        }))
    }
}

struct LibraryExtension {
    inner: Rc<dyn Extension>,
    library: Rc<Library>,
}

impl Extension for LibraryExtension {
    fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
        self.inner.setup()
    }

    fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
        let handlers = Rc::clone(&self.inner).handlers()?;
        Ok(handlers
            .into_iter()
            .map(|handler| {
                let library = Rc::clone(&self.library);
                let inner = handler.callback;
                Handler {
                    name: handler.name,
                    doc: handler.doc,
                    callback: callback(move |args| {
                        let pending = inner(args);
                        let library = Rc::clone(&library);
                        async move {
                            let reply = pending.await;
                            drop(library);
                            reply
                        }
                    }),
                }
            })
            .collect())
    }
}

/// A shared library from the host system that exports no kiln entry
/// points, if one can be found.
#[cfg(test)]
pub(crate) fn system_library() -> Option<std::path::PathBuf> {
    const CANDIDATES: &[&str] = &[
        "/lib/x86_64-linux-gnu/libm.so.6",
        "/usr/lib/x86_64-linux-gnu/libm.so.6",
        "/lib/aarch64-linux-gnu/libm.so.6",
        "/usr/lib/aarch64-linux-gnu/libm.so.6",
        "/lib64/libm.so.6",
        "/usr/lib64/libm.so.6",
        "/usr/lib/libm.so.6",
        "/lib/libm.so.6",
    ];
    if !cfg!(target_os = "linux") {
        return None;
    }
    CANDIDATES
        .iter()
        .map(std::path::PathBuf::from)
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_library_without_entry_point() {
        let Some(library) = system_library() else {
            return;
        };
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("libmath.{}", std::env::consts::DLL_EXTENSION));
        std::fs::copy(&library, &path).unwrap();

        let source = ExtensionSource::new(path);
        assert!(matches!(
            DylibResolver.resolve(&source),
            Err(ResolveError::MissingEntryPoint("kiln_abi_version"))
        ));
    }

    #[test]
    fn test_extension_matches_platform() {
        assert_eq!(DylibResolver.extension(), std::env::consts::DLL_EXTENSION);
    }

    #[test]
    fn test_garbage_library_is_resolve_error() {
        let dir = tempdir().unwrap();
        let path = dir
            .path()
            .join(format!("broken.{}", std::env::consts::DLL_EXTENSION));
        std::fs::write(&path, b"definitely not a shared object").unwrap();

        let source = ExtensionSource::new(path);
        assert!(matches!(
            DylibResolver.resolve(&source),
            Err(ResolveError::Library(_))
        ));
    }

    #[test]
    fn test_symbol_is_nul_terminated() {
        assert_eq!(symbol("kiln_abi_version"), "kiln_abi_version\0");
    }
}
