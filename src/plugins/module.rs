//! Source files, resolved modules and the types they export.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Result;

use super::api::{Construct, Extension, ExtensionArgs};
use super::capability::Shape;
use crate::error::ResolveError;

/// One candidate plugin file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionSource {
    pub path: PathBuf,
    /// File stem, used as the module's logical name.
    pub name: String,
}

impl ExtensionSource {
    pub fn new(path: PathBuf) -> Self {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { path, name }
    }

    /// File name for log lines.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// A type exported by a module, before the capability check.
pub trait ExtensionType {
    fn name(&self) -> &str;

    fn shape(&self) -> Shape;

    /// Build an instance. Only called on types whose shape conforms.
    fn construct(&self, args: ExtensionArgs<'_>) -> Result<Rc<dyn Extension>>;
}

/// The result of resolving one source file.
pub struct ExtensionModule {
    pub name: String,
    pub types: Vec<Box<dyn ExtensionType>>,
}

impl ExtensionModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
        }
    }

    /// Add a Rust extension type.
    #[must_use]
    pub fn with<T: Construct>(mut self) -> Self {
        self.push::<T>();
        self
    }

    pub fn push<T: Construct>(&mut self) {
        self.types.push(Box::new(NativeType::<T>::new()));
    }

    pub fn push_type(&mut self, ty: Box<dyn ExtensionType>) {
        self.types.push(ty);
    }

    pub fn type_names(&self) -> Vec<&str> {
        self.types.iter().map(|t| t.name()).collect()
    }
}

impl std::fmt::Debug for ExtensionModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionModule")
            .field("name", &self.name)
            .field("types", &self.type_names())
            .finish()
    }
}

/// Turns files with one extension into modules.
pub trait ModuleResolver {
    /// File extension handled, without the leading dot.
    fn extension(&self) -> &str;

    fn resolve(&self, source: &ExtensionSource) -> Result<ExtensionModule, ResolveError>;
}

/// A Rust type implementing [`Construct`].
pub struct NativeType<T> {
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Construct> NativeType<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T: Construct> Default for NativeType<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Construct> ExtensionType for NativeType<T> {
    fn name(&self) -> &str {
        T::type_name()
    }

    fn shape(&self) -> Shape {
        Shape::COMPLETE
    }

    fn construct(&self, args: ExtensionArgs<'_>) -> Result<Rc<dyn Extension>> {
        Ok(Rc::new(T::construct(args)?))
    }
}

/// Whether `path` ends in `.extension`, ignoring ASCII case.
pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(extension))
}
