//! The extension loading pipeline.
//!
//! A pass walks `directory > file > class > handler`. Each level contains
//! its own failures: a broken file is logged and the next file is tried, a
//! type whose constructor fails does not stop its siblings, and a rejected
//! command does not stop the rest of its instance's handlers. Only
//! cancellation aborts the pass.

pub mod handlers;
pub mod lifecycle;
pub mod report;
pub mod scanner;

pub use lifecycle::{Scheduler, Supervisor, TaskOutcome, TaskStatus};
pub use report::{Boundary, Failure, LoadReport, RegisteredEntry};

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Cancelled, LoadError};
use crate::plugins::{
    capability, DylibResolver, ExtensionArgs, ExtensionModule, ExtensionSource, ExtensionType,
    Handler, LuaResolver, ModuleResolver, Params,
};
use crate::registry::{CommandRegistry, RegistryError, Scope};
use crate::settings::{Section, SettingsStore};

/// Per-pass inputs shared by every extension.
#[derive(Clone, Default)]
pub struct LoadContext {
    scheduler: Option<Rc<dyn Scheduler>>,
    params: Params,
    cancel: CancellationToken,
}

impl LoadContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run setup hooks in the background instead of inline.
    #[must_use]
    pub fn with_scheduler(mut self, scheduler: Rc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Extra arguments for every constructor.
    #[must_use]
    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn scheduler(&self) -> Option<&Rc<dyn Scheduler>> {
        self.scheduler.as_ref()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn check(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            return Err(Cancelled);
        }
        Ok(())
    }
}

impl std::fmt::Debug for LoadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadContext")
            .field("scheduled", &self.scheduler.is_some())
            .field("params", &self.params)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Loads extensions into a [`CommandRegistry`].
pub struct Loader<R> {
    registry: R,
    settings: Arc<dyn SettingsStore>,
    resolvers: Vec<Box<dyn ModuleResolver>>,
}

impl<R: CommandRegistry> Loader<R> {
    /// A loader that understands Lua scripts and native libraries.
    pub fn new(registry: R, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            registry,
            settings,
            resolvers: vec![Box::new(LuaResolver::new()), Box::new(DylibResolver::new())],
        }
    }

    /// Add a resolver, replacing any that handles the same extension.
    #[must_use]
    pub fn with_resolver(mut self, resolver: impl ModuleResolver + 'static) -> Self {
        self.resolvers
            .retain(|r| !r.extension().eq_ignore_ascii_case(resolver.extension()));
        self.resolvers.push(Box::new(resolver));
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut R {
        &mut self.registry
    }

    pub fn into_registry(self) -> R {
        self.registry
    }

    fn resolver(&self, extension: &str) -> Option<&dyn ModuleResolver> {
        let resolver = self
            .resolvers
            .iter()
            .find(|r| r.extension().eq_ignore_ascii_case(extension))?;
        Some(resolver.as_ref())
    }

    /// Load every `*.extension` file in `directory`.
    ///
    /// Failures are collected in the report; only cancellation is an error.
    pub async fn load(
        &mut self,
        directory: impl AsRef<Path>,
        extension: &str,
        ctx: &LoadContext,
    ) -> Result<LoadReport, Cancelled> {
        let directory = directory.as_ref();
        let extension = extension.trim_start_matches('.');
        let subject = directory.display().to_string();
        let mut report = LoadReport::new();
        ctx.check()?;

        // The directory is created even when nothing can load from it yet.
        let files = match scanner::scan(directory, extension) {
            Ok(files) => files,
            Err(err) => {
                report.fail(Boundary::Directory, subject, &err);
                return Ok(report);
            }
        };

        if self.resolver(extension).is_none() {
            report.fail(
                Boundary::Directory,
                subject,
                &LoadError::NoResolver(extension.to_string()),
            );
            return Ok(report);
        }

        for file in files {
            ctx.check()?;
            match file {
                Ok(source) => self.load_file(&source, extension, ctx, &mut report).await?,
                Err(err) => {
                    report.fail(Boundary::Directory, subject.clone(), &err);
                    break;
                }
            }
        }

        info!(
            directory = %subject,
            registered = report.registered.len(),
            failures = report.failures.len(),
            "Extension load finished"
        );
        Ok(report)
    }

    /// Run a module built in code through the same stages as a scanned
    /// file.
    pub async fn install(
        &mut self,
        module: ExtensionModule,
        ctx: &LoadContext,
    ) -> Result<LoadReport, Cancelled> {
        let mut report = LoadReport::new();
        ctx.check()?;
        self.install_module(module, ctx, &mut report).await?;
        Ok(report)
    }

    pub async fn sync(&mut self, scope: &Scope) -> Result<(), RegistryError> {
        self.registry.sync(scope).await
    }

    pub async fn clear(&mut self, scope: &Scope) -> Result<(), RegistryError> {
        self.registry.clear(scope).await
    }

    /// [`Loader::load`] followed by one sync. A cancelled pass is never
    /// synced.
    pub async fn load_and_sync(
        &mut self,
        directory: impl AsRef<Path>,
        extension: &str,
        scope: &Scope,
        ctx: &LoadContext,
    ) -> Result<LoadReport, LoadError> {
        let report = self.load(directory, extension, ctx).await?;
        ctx.check()?;
        self.sync(scope).await.map_err(LoadError::Sync)?;
        Ok(report)
    }

    async fn load_file(
        &mut self,
        source: &ExtensionSource,
        extension: &str,
        ctx: &LoadContext,
        report: &mut LoadReport,
    ) -> Result<(), Cancelled> {
        let file = source.file_name();
        let Some(resolver) = self.resolver(extension) else {
            report.fail(Boundary::File, file, &LoadError::NoResolver(extension.to_string()));
            return Ok(());
        };

        debug!(file = %file, "Resolving extension module");
        let resolved = catch_panic(|| resolver.resolve(source))
            .unwrap_or_else(|message| Err(crate::error::ResolveError::Panicked(message)));
        match resolved {
            Ok(module) => self.install_module(module, ctx, report).await,
            Err(source) => {
                report.fail(Boundary::File, file.clone(), &LoadError::Resolve { file, source });
                Ok(())
            }
        }
    }

    async fn install_module(
        &mut self,
        module: ExtensionModule,
        ctx: &LoadContext,
        report: &mut LoadReport,
    ) -> Result<(), Cancelled> {
        for ty in &module.types {
            ctx.check()?;
            match self.load_type(&module.name, ty.as_ref(), ctx, report).await {
                Ok(()) => {}
                Err(LoadError::Cancelled) => return Err(Cancelled),
                Err(err @ LoadError::Capability { .. }) => report.reject(ty.name(), &err),
                Err(err) => report.fail(Boundary::Class, ty.name(), &err),
            }
        }
        Ok(())
    }

    async fn load_type(
        &mut self,
        module: &str,
        ty: &dyn ExtensionType,
        ctx: &LoadContext,
        report: &mut LoadReport,
    ) -> Result<(), LoadError> {
        let name = ty.name().to_string();
        capability::check(ty.shape()).map_err(|reason| LoadError::Capability {
            name: name.clone(),
            reason: reason.to_string(),
        })?;

        let mut config = Section::open(Arc::clone(&self.settings), &name).map_err(|source| {
            LoadError::Settings {
                name: name.clone(),
                source,
            }
        })?;
        let args = ExtensionArgs {
            config: &mut config,
            params: ctx.params(),
        };
        let instance = catch_panic(|| ty.construct(args))
            .map_err(|message| LoadError::Panicked {
                subject: format!("{name}.new"),
                message,
            })?
            .map_err(|source| LoadError::Construct {
                name: name.clone(),
                source,
            })?;
        drop(config);
        debug!(module, extension = %name, "Constructed extension");

        lifecycle::run_setup(&instance, format!("{name}.setup"), ctx).await?;

        let handlers = catch_panic(|| instance.handlers())
            .map_err(|message| LoadError::Panicked {
                subject: format!("{name} handler discovery"),
                message,
            })?
            .map_err(|error| LoadError::Handlers {
                name: name.clone(),
                error,
            })?;

        self.register_handlers(module, &name, handlers, ctx, report)?;
        Ok(())
    }

    fn register_handlers(
        &mut self,
        module: &str,
        extension: &str,
        handlers: Vec<Handler>,
        ctx: &LoadContext,
        report: &mut LoadReport,
    ) -> Result<(), Cancelled> {
        let mut seen = HashSet::new();
        for handler in handlers {
            ctx.check()?;
            let qualified = format!("{extension}.{}", handler.name);
            if handlers::is_private(&handler.name) {
                debug!(handler = %qualified, "Skipping private handler");
                continue;
            }
            if !seen.insert(handler.name.clone()) {
                let err = LoadError::Register {
                    qualified: qualified.clone(),
                    source: RegistryError::Duplicate(handler.name),
                };
                report.fail(Boundary::Handler, qualified, &err);
                continue;
            }

            let command = handlers::build_command(handler);
            let entry = RegisteredEntry {
                module: module.to_string(),
                extension: extension.to_string(),
                name: command.name.clone(),
                description: command.description.clone(),
            };
            let registry = &mut self.registry;
            let err = match catch_panic(|| registry.add_command(command)) {
                Ok(Ok(())) => {
                    report.register(entry);
                    continue;
                }
                Ok(Err(source)) => LoadError::Register {
                    qualified: qualified.clone(),
                    source,
                },
                Err(message) => LoadError::Panicked {
                    subject: qualified.clone(),
                    message,
                },
            };
            report.fail(Boundary::Handler, qualified, &err);
        }
        Ok(())
    }
}

/// Text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run extension code, turning a panic into its message.
fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(&*payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::{Construct, Extension};
    use crate::registry::{CommandTree, NullSink};
    use crate::settings::MemorySettings;
    use anyhow::{bail, Result};
    use futures::future::{self, FutureExt, LocalBoxFuture};
    use std::time::Duration;
    use tokio::task::LocalSet;

    const LONG_DOC: &str = "Report every greeting this extension has sent since the host \
        started, grouped by channel and sorted by the number of replies received.";

    struct Greeter {
        greeting: String,
    }

    impl Construct for Greeter {
        fn construct(args: ExtensionArgs<'_>) -> Result<Self> {
            let greeting = args.config.get("greeting").unwrap_or("Hello").to_string();
            args.config.set("greeting", greeting.as_str())?;
            Ok(Self { greeting })
        }
    }

    impl Extension for Greeter {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(vec![
                Handler::bound(&self, "hello", Some("Say hi"), |this, args| async move {
                    Ok(format!("{}, {}", this.greeting, args.join(" ")))
                }),
                Handler::new("_secret", Some("Hidden"), |_args| async { Ok(String::new()) }),
                Handler::new("plain", None, |_args| async { Ok(String::new()) }),
                Handler::new("stats", Some(LONG_DOC), |_args| async { Ok(String::new()) }),
            ])
        }
    }

    struct Strict;

    impl Construct for Strict {
        fn construct(args: ExtensionArgs<'_>) -> Result<Self> {
            args.config.get_string("token")?;
            Ok(Self)
        }
    }

    impl Extension for Strict {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(vec![Handler::new("strict", None, |_args| async { Ok(String::new()) })])
        }
    }

    struct Panicky;

    impl Construct for Panicky {
        fn construct(_args: ExtensionArgs<'_>) -> Result<Self> {
            panic!("constructor exploded")
        }
    }

    impl Extension for Panicky {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(Vec::new())
        }
    }

    struct BrokenSetup;

    impl Construct for BrokenSetup {
        fn construct(_args: ExtensionArgs<'_>) -> Result<Self> {
            Ok(Self)
        }
    }

    impl Extension for BrokenSetup {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            async { bail!("database unreachable") }.boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(vec![Handler::new("query", None, |_args| async { Ok(String::new()) })])
        }
    }

    struct Twice;

    impl Construct for Twice {
        fn construct(_args: ExtensionArgs<'_>) -> Result<Self> {
            Ok(Self)
        }
    }

    impl Extension for Twice {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            async { Ok(()) }.boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(vec![
                Handler::new("dup", Some("first"), |_args| async { Ok("first".to_string()) }),
                Handler::new("dup", Some("second"), |_args| async { Ok("second".to_string()) }),
                Handler::new("after", None, |_args| async { Ok(String::new()) }),
            ])
        }
    }

    struct Stuck;

    impl Construct for Stuck {
        fn construct(_args: ExtensionArgs<'_>) -> Result<Self> {
            Ok(Self)
        }
    }

    impl Extension for Stuck {
        fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
            future::pending().boxed_local()
        }

        fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
            Ok(vec![Handler::new("never", None, |_args| async { Ok(String::new()) })])
        }
    }

    fn loader() -> (Loader<CommandTree>, Arc<MemorySettings>) {
        let store = Arc::new(MemorySettings::new());
        (Loader::new(CommandTree::new(NullSink), store.clone()), store)
    }

    #[tokio::test]
    async fn test_install_registers_public_handlers() {
        let (mut loader, store) = loader();
        let module = ExtensionModule::new("greet").with::<Greeter>();
        let report = loader.install(module, &LoadContext::new()).await.unwrap();

        let names: Vec<_> = report.commands().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["hello", "plain", "stats"]);
        assert!(report.is_clean());

        let tree = loader.registry();
        assert_eq!(tree.get("hello").unwrap().description, "Say hi");
        assert_eq!(tree.get("plain").unwrap().description, "…");
        let stats = &tree.get("stats").unwrap().description;
        assert_eq!(stats.chars().count(), handlers::MAX_DESCRIPTION_LENGTH);
        assert!(stats.ends_with('…'));
        assert!(tree.get("_secret").is_none());

        let reply = tree.invoke("hello", vec!["Ada".into()]).await.unwrap();
        assert_eq!(reply, "Hello, Ada");
        assert_eq!(store.load_section("Greeter").unwrap()["greeting"], "Hello");
    }

    #[tokio::test]
    async fn test_constructor_reads_config_section() {
        let (mut loader, store) = loader();
        let mut values = crate::settings::Values::new();
        values.insert("greeting".into(), "Ahoy".into());
        store.store_section("Greeter", &values).unwrap();

        let module = ExtensionModule::new("greet").with::<Greeter>();
        loader.install(module, &LoadContext::new()).await.unwrap();
        let reply = loader.registry().invoke("hello", vec!["Bo".into()]).await.unwrap();
        assert_eq!(reply, "Ahoy, Bo");
    }

    #[tokio::test]
    async fn test_class_failures_do_not_stop_siblings() {
        let (mut loader, store) = loader();
        let module = ExtensionModule::new("mixed")
            .with::<Strict>()
            .with::<Panicky>()
            .with::<BrokenSetup>()
            .with::<Greeter>();
        let report = loader.install(module, &LoadContext::new()).await.unwrap();

        assert_eq!(report.registered.len(), 3);
        let failed: Vec<_> = report
            .failures_at(Boundary::Class)
            .map(|f| f.subject.as_str())
            .collect();
        assert_eq!(failed, vec!["Strict", "Panicky", "BrokenSetup"]);
        assert!(report.failures[1].error.contains("constructor exploded"));
        assert!(report.failures[2].error.contains("database unreachable"));
        assert!(loader.registry().get("query").is_none());

        // the missing key is created for the operator to fill in
        assert_eq!(store.load_section("Strict").unwrap()["token"], "");
    }

    #[tokio::test]
    async fn test_duplicate_handler_is_handler_failure() {
        let (mut loader, _) = loader();
        let module = ExtensionModule::new("twice").with::<Twice>();
        let report = loader.install(module, &LoadContext::new()).await.unwrap();

        assert_eq!(report.commands(), vec![("dup", "first"), ("after", "…")]);
        let failures: Vec<_> = report.failures_at(Boundary::Handler).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject, "Twice.dup");
    }

    #[tokio::test]
    async fn test_registry_rejection_is_contained() {
        let (mut loader, _) = loader();
        let first = ExtensionModule::new("a").with::<Twice>();
        loader.install(first, &LoadContext::new()).await.unwrap();

        let second = ExtensionModule::new("b").with::<Greeter>().with::<Twice>();
        let report = loader.install(second, &LoadContext::new()).await.unwrap();
        assert_eq!(report.registered.len(), 3);
        // second Twice: in-instance duplicate plus two registry collisions
        assert_eq!(report.failures_at(Boundary::Handler).count(), 3);
    }

    #[tokio::test]
    async fn test_scheduled_setup_does_not_block_registration() {
        LocalSet::new()
            .run_until(async {
                let (mut loader, _) = loader();
                let supervisor = Rc::new(Supervisor::new());
                let ctx = LoadContext::new().with_scheduler(supervisor.clone());
                let module = ExtensionModule::new("mixed")
                    .with::<BrokenSetup>()
                    .with::<Stuck>();
                let report = loader.install(module, &ctx).await.unwrap();

                assert!(report.is_clean());
                assert!(loader.registry().get("query").is_some());
                assert!(loader.registry().get("never").is_some());

                tokio::time::sleep(Duration::from_millis(10)).await;
                supervisor.abort_all();
                let outcomes = supervisor.join_all().await;
                assert_eq!(outcomes[0].source, "BrokenSetup.setup");
                assert_eq!(
                    outcomes[0].status,
                    TaskStatus::Failed("database unreachable".into())
                );
                assert_eq!(outcomes[1].status, TaskStatus::Aborted);
            })
            .await;
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let (mut loader, _) = loader();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = LoadContext::new().with_cancel(cancel);
        let module = ExtensionModule::new("greet").with::<Greeter>();
        assert_eq!(loader.install(module, &ctx).await.unwrap_err(), Cancelled);
        assert!(loader.registry().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_inline_setup() {
        let (mut loader, _) = loader();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let ctx = LoadContext::new().with_cancel(cancel);
        let module = ExtensionModule::new("slow").with::<Stuck>().with::<Greeter>();
        assert!(loader.install(module, &ctx).await.is_err());
        assert!(loader.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_extension_is_directory_failure() {
        let (mut loader, _) = loader();
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("scripts").join("python");
        let report = loader.load(&target, "py", &LoadContext::new()).await.unwrap();
        assert_eq!(report.failures_at(Boundary::Directory).count(), 1);
        assert!(report.registered.is_empty());
        assert!(target.is_dir());
    }

    /// Native libraries where `ping.<ext>` stands in for a library built
    /// against this crate and everything else is opened for real.
    struct PartlyCompiledIn;

    impl ModuleResolver for PartlyCompiledIn {
        fn extension(&self) -> &str {
            std::env::consts::DLL_EXTENSION
        }

        fn resolve(
            &self,
            source: &ExtensionSource,
        ) -> Result<ExtensionModule, crate::error::ResolveError> {
            if source.name == "ping" {
                return Ok(ExtensionModule::new("ping").with::<Greeter>());
            }
            DylibResolver.resolve(source)
        }
    }

    #[tokio::test]
    async fn test_foreign_library_is_file_failure() {
        let Some(library) = crate::plugins::dylib::system_library() else {
            return;
        };
        let dir = tempfile::tempdir().unwrap();
        let ext = std::env::consts::DLL_EXTENSION;
        std::fs::copy(&library, dir.path().join(format!("math.{ext}"))).unwrap();
        std::fs::write(dir.path().join(format!("ping.{ext}")), b"").unwrap();

        let (loader, _) = loader();
        let mut loader = loader.with_resolver(PartlyCompiledIn);
        let report = loader.load(dir.path(), ext, &LoadContext::new()).await.unwrap();

        let failures: Vec<_> = report.failures_at(Boundary::File).collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject, format!("math.{ext}"));
        assert!(failures[0].error.contains("kiln_abi_version"));
        assert_eq!(report.failures.len(), 1);
        assert!(loader.registry().get("hello").is_some());
    }

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("plain")).unwrap_err();
        assert_eq!(panic_message(&*payload), "plain");
        let payload = std::panic::catch_unwind(|| panic!("formatted {}", 7)).unwrap_err();
        assert_eq!(panic_message(&*payload), "formatted 7");
        assert_eq!(catch_panic(|| 5), Ok(5));
    }
}
