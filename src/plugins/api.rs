//! Extension API definitions
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use anyhow::Result;
use futures::future::{FutureExt, LocalBoxFuture};

use crate::settings::Section;

/// Extra string arguments the host passes to every constructor.
pub type Params = BTreeMap<String, String>;

/// Callback registered for a command: receives the caller's arguments and
/// returns the reply text.
pub type CommandCallback = Rc<dyn Fn(Vec<String>) -> LocalBoxFuture<'static, Result<String>>>;

/// Box an async closure into a [`CommandCallback`].
pub fn callback<F, Fut>(f: F) -> CommandCallback
where
    F: Fn(Vec<String>) -> Fut + 'static,
    Fut: Future<Output = Result<String>> + 'static,
{
    Rc::new(move |args: Vec<String>| f(args).boxed_local())
}

/// A live extension instance.
///
/// The loader runs [`Extension::setup`] exactly once, then asks the instance
/// for its handlers. Handlers keep the instance alive through their
/// callbacks; the loader keeps no other reference.
pub trait Extension: 'static {
    /// One-time asynchronous initialization.
    fn setup(&self) -> LocalBoxFuture<'_, Result<()>>;

    /// Command handlers exposed by this instance, in declaration order.
    fn handlers(self: Rc<Self>) -> Result<Vec<Handler>>;
}

/// Arguments handed to an extension constructor.
///
/// `config` is borrowed for the duration of the constructor only.
pub struct ExtensionArgs<'a> {
    pub config: &'a mut Section,
    pub params: &'a Params,
}

/// Constructor half of the extension contract for Rust types.
pub trait Construct: Extension + Sized {
    fn construct(args: ExtensionArgs<'_>) -> Result<Self>;

    /// Name used to key the configuration section.
    fn type_name() -> &'static str {
        short_type_name::<Self>()
    }
}

/// A method exposed as a command.
#[derive(Clone)]
pub struct Handler {
    pub name: String,
    pub doc: Option<String>,
    pub callback: CommandCallback,
}

impl Handler {
    pub fn new<F, Fut>(name: impl Into<String>, doc: Option<&str>, f: F) -> Self
    where
        F: Fn(Vec<String>) -> Fut + 'static,
        Fut: Future<Output = Result<String>> + 'static,
    {
        Self {
            name: name.into(),
            doc: doc.map(str::to_string),
            callback: callback(f),
        }
    }

    /// A handler bound to `instance`; each call receives its own `Rc`.
    pub fn bound<T, F, Fut>(instance: &Rc<T>, name: impl Into<String>, doc: Option<&str>, f: F) -> Self
    where
        T: 'static,
        F: Fn(Rc<T>, Vec<String>) -> Fut + 'static,
        Fut: Future<Output = Result<String>> + 'static,
    {
        let instance = Rc::clone(instance);
        Self::new(name, doc, move |args| f(Rc::clone(&instance), args))
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("doc", &self.doc)
            .finish_non_exhaustive()
    }
}

/// Last path segment of a type name, without generic arguments.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
