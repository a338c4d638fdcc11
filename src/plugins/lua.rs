//! Lua extension scripts.
//!
//! Each script runs in its own sandboxed state and must return a table
//! mapping type names to class tables:
//!
//! ```lua
//! local Greeter = { docs = { hello = "Say hi" } }
//! Greeter.__index = Greeter
//!
//! function Greeter.new(config, params)
//!     return setmetatable({ greeting = config.greeting or "Hello" }, Greeter)
//! end
//!
//! function Greeter:setup() end
//!
//! function Greeter:hello(name)
//!     return self.greeting .. ", " .. (name or "world")
//! end
//!
//! return { Greeter = Greeter }
//! ```
//!
//! `new` is called synchronously and must not call `kiln.sleep`; `setup`
//! and command methods run as coroutines and may.

use std::fs;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::{FutureExt, LocalBoxFuture};
use mlua::{Function, Lua, MultiValue, RegistryKey, Table, Value};
use tracing::{debug, info, warn};

use super::api::{Extension, ExtensionArgs, Handler};
use super::capability::Shape;
use super::module::{ExtensionModule, ExtensionSource, ExtensionType, ModuleResolver};
use crate::error::ResolveError;
use crate::settings::Values;

/// Class members that are lifecycle hooks rather than commands.
const RESERVED_MEMBERS: &[&str] = &["new", "setup"];

const SANDBOX: &str = r#"
    os.execute = nil
    os.exit = nil
    io.popen = nil
    loadfile = nil
    dofile = nil
"#;

/// Resolves `*.lua` files.
#[derive(Debug, Default, Clone, Copy)]
pub struct LuaResolver;

impl LuaResolver {
    pub fn new() -> Self {
        Self
    }
}

impl ModuleResolver for LuaResolver {
    fn extension(&self) -> &str {
        "lua"
    }

    fn resolve(&self, source: &ExtensionSource) -> Result<ExtensionModule, ResolveError> {
        let code = fs::read_to_string(&source.path).map_err(|e| ResolveError::Io {
            path: source.path.clone(),
            source: e,
        })?;

        let lua = Rc::new(sandboxed(&source.name)?);
        let mut entries = Vec::new();
        {
            let exported: Value = lua
                .load(code.as_str())
                .set_name(format!("@{}", source.file_name()))
                .eval()?;
            let table = match exported {
                Value::Table(table) => table,
                other => return Err(ResolveError::NotARegistry(other.type_name().to_string())),
            };

            for pair in table.pairs::<Value, Value>() {
                let (key, value) = pair?;
                let name = match &key {
                    Value::String(name) => match name.to_str() {
                        Ok(name) => name.to_string(),
                        Err(_) => {
                            debug!(module = %source.name, "Ignoring export key that is not valid UTF-8");
                            continue;
                        }
                    },
                    other => {
                        debug!(module = %source.name, key = other.type_name(), "Ignoring non-string export key");
                        continue;
                    }
                };
                let shape = shape_of(&value);
                let class = lua.create_registry_value(value)?;
                entries.push(LuaType {
                    lua: Rc::clone(&lua),
                    name,
                    class: Rc::new(class),
                    shape,
                });
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));

        let mut module = ExtensionModule::new(source.name.clone());
        for entry in entries {
            module.push_type(Box::new(entry));
        }
        debug!(module = %module.name, types = ?module.type_names(), "Resolved Lua module");
        Ok(module)
    }
}

/// Fresh Lua state with dangerous functions removed and the `kiln` host
/// table installed.
fn sandboxed(module: &str) -> mlua::Result<Lua> {
    let lua = Lua::new();
    lua.load(SANDBOX).set_name("sandbox").exec()?;
    {
        let host = lua.create_table()?;

        let tag = module.to_string();
        host.set(
            "log",
            lua.create_function(move |_, message: String| {
                info!(module = %tag, "{message}");
                Ok(())
            })?,
        )?;

        let tag = module.to_string();
        host.set(
            "warn",
            lua.create_function(move |_, message: String| {
                warn!(module = %tag, "{message}");
                Ok(())
            })?,
        )?;

        host.set(
            "sleep",
            lua.create_async_function(|_, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            })?,
        )?;

        host.set("module", module)?;
        lua.globals().set("kiln", host)?;
    }
    Ok(lua)
}

/// A member lookup that raises (a throwing `__index`, say) counts as a
/// missing member, so the entry is rejected on its own.
fn shape_of(value: &Value) -> Shape {
    let Value::Table(class) = value else {
        return Shape::default();
    };
    let has_function = |member: &str| match class.get::<_, Value>(member) {
        Ok(value) => matches!(value, Value::Function(_)),
        Err(e) => {
            debug!(member, error = %e, "Class member lookup failed");
            false
        }
    };
    Shape {
        is_type: true,
        constructor: has_function("new"),
        setup: has_function("setup"),
    }
}

/// Config values are strings; numbers and booleans are stringified and
/// anything else is dropped.
fn scalar_to_string(value: &Value) -> mlua::Result<Option<String>> {
    Ok(match value {
        Value::String(s) => Some(s.to_str()?.to_string()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    })
}

/// A class table exported by a script.
struct LuaType {
    lua: Rc<Lua>,
    name: String,
    class: Rc<RegistryKey>,
    shape: Shape,
}

impl ExtensionType for LuaType {
    fn name(&self) -> &str {
        &self.name
    }

    fn shape(&self) -> Shape {
        self.shape
    }

    fn construct(&self, args: ExtensionArgs<'_>) -> Result<Rc<dyn Extension>> {
        let instance = {
            let class: Table = self.lua.registry_value(&self.class)?;
            let new: Function = class.get("new")?;

            let config = self.lua.create_table()?;
            for (key, value) in args.config.iter() {
                config.set(key, value)?;
            }
            let params = self.lua.create_table()?;
            for (key, value) in args.params {
                params.set(key.as_str(), value.as_str())?;
            }

            let instance: Value = new.call((config.clone(), params))?;
            if matches!(instance, Value::Nil) {
                return Err(anyhow!("{}.new returned nil", self.name));
            }

            // Constructors may fill in defaults; persist them.
            let mut updates = Values::new();
            for pair in config.pairs::<String, Value>() {
                let (key, value) = pair?;
                if let Some(value) = scalar_to_string(&value)? {
                    updates.insert(key, value);
                }
            }
            args.config.merge(updates)?;

            self.lua.create_registry_value(instance)?
        };

        Ok(Rc::new(LuaExtension {
            lua: Rc::clone(&self.lua),
            name: self.name.clone(),
            class: Rc::clone(&self.class),
            instance,
        }))
    }
}

/// An instance returned by a class's `new`.
struct LuaExtension {
    lua: Rc<Lua>,
    name: String,
    class: Rc<RegistryKey>,
    instance: RegistryKey,
}

impl LuaExtension {
    async fn call(&self, method: &str, args: Vec<String>) -> Result<String> {
        let class: Table = self.lua.registry_value(&self.class)?;
        let instance: Value = self.lua.registry_value(&self.instance)?;
        let function: Function = class.get(method)?;

        let mut values = Vec::with_capacity(args.len() + 1);
        values.push(instance);
        for arg in &args {
            values.push(Value::String(self.lua.create_string(arg)?));
        }

        let reply: Option<String> = function.call_async(MultiValue::from_vec(values)).await?;
        Ok(reply.unwrap_or_default())
    }

    fn member_names(&self) -> Result<Vec<String>> {
        let class: Table = self.lua.registry_value(&self.class)?;
        let mut names = Vec::new();
        for pair in class.pairs::<Value, Value>() {
            let (key, value) = pair?;
            if let (Value::String(key), Value::Function(_)) = (&key, &value) {
                let name = key.to_str()?;
                if !RESERVED_MEMBERS.contains(&name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn doc(&self, method: &str) -> Result<Option<String>> {
        let class: Table = self.lua.registry_value(&self.class)?;
        let Value::Table(docs) = class.get::<_, Value>("docs")? else {
            return Ok(None);
        };
        Ok(docs.get::<_, Option<String>>(method)?)
    }
}

impl Extension for LuaExtension {
    fn setup(&self) -> LocalBoxFuture<'_, Result<()>> {
        async move {
            let class: Table = self.lua.registry_value(&self.class)?;
            let instance: Value = self.lua.registry_value(&self.instance)?;
            let setup: Function = class.get("setup")?;
            setup.call_async::<_, ()>(instance).await?;
            debug!(extension = %self.name, "Lua setup finished");
            Ok(())
        }
        .boxed_local()
    }

    fn handlers(self: Rc<Self>) -> Result<Vec<Handler>> {
        let mut handlers = Vec::new();
        for name in self.member_names()? {
            let doc = self.doc(&name)?;
            let method = name.clone();
            handlers.push(Handler::bound(&self, name, doc.as_deref(), move |this, args| {
                let method = method.clone();
                async move { this.call(&method, args).await }
            }));
        }
        Ok(handlers)
    }
}
