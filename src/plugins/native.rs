//! Entry point exported by native extension libraries.
//!
//! A library built as a `cdylib` against this crate declares its types with
//! [`export_extensions!`](crate::export_extensions):
//!
//! ```rust,ignore
//! kiln::export_extensions!(Greeter, Counter);
//! ```
//!
//! Native extensions share Rust trait objects with the host, so they must be
//! built with the same compiler and the same version of this crate.

use super::api::Construct;
use super::module::{ExtensionModule, ExtensionType, NativeType};

/// Bumped whenever [`ExtensionRegistrar`] or the extension traits change.
pub const ABI_VERSION: u32 = 1;

/// Symbol returning the library's [`ABI_VERSION`].
pub const ABI_SYMBOL: &str = "kiln_abi_version";

/// Symbol that fills an [`ExtensionRegistrar`].
pub const REGISTER_SYMBOL: &str = "kiln_register_extensions";

pub type AbiVersionFn = fn() -> u32;
pub type RegisterFn = fn(&mut ExtensionRegistrar);

/// Collects the types a library exports.
#[derive(Default)]
pub struct ExtensionRegistrar {
    types: Vec<Box<dyn ExtensionType>>,
}

impl ExtensionRegistrar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T: Construct>(&mut self) {
        self.types.push(Box::new(NativeType::<T>::new()));
    }

    pub fn register_type(&mut self, ty: Box<dyn ExtensionType>) {
        self.types.push(ty);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn into_module(self, name: impl Into<String>) -> ExtensionModule {
        let mut module = ExtensionModule::new(name);
        for ty in self.types {
            module.push_type(ty);
        }
        module
    }
}

/// Export the listed [`Construct`] types from a native extension library.
#[macro_export]
macro_rules! export_extensions {
    ($($ty:ty),+ $(,)?) => {
        #[no_mangle]
        pub fn kiln_abi_version() -> u32 {
            $crate::plugins::native::ABI_VERSION
        }

        #[no_mangle]
        pub fn kiln_register_extensions(registrar: &mut $crate::plugins::native::ExtensionRegistrar) {
            $( registrar.register::<$ty>(); )+
        }
    };
}
