//! Interpreter host: one Lua VM, its callback table, and its bridges.
//!
//! Lifecycle: `Unloaded -> Loaded -> Running -> Stopped`. `Stopped` is
//! terminal; a reload always builds a fresh host.
//!
//! Script failures are contained here. Compile errors, runtime errors, and
//! calls that overrun their budget are logged with the function name and
//! never propagate past the host.
//!
//! The budget is enforced by an instruction hook. Protected calls
//! (`pcall`, `xpcall`, `coroutine.resume`) re-raise the budget error once
//! it has fired, so a script cannot swallow it. A script blocked inside a
//! single native call (a blocking `io.read`, say) executes no instructions
//! and is not interrupted.

mod modules;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use fleet_proto::DeviceSnapshot;
use fleet_reconcile::{Fingerprint, ScriptContent};
use mlua::{Function, HookTriggers, IntoLuaMulti, Lua, MultiValue, Table, Value, VmState};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bridges::{Bridges, Envelope, EventSink, ScriptEvent};

/// Instructions executed between watchdog checks.
const WATCHDOG_SLICE: u32 = 10_000;

/// Host lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Unloaded,
    Loaded,
    Running,
    Stopped,
}

/// Host errors.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("script failed to compile: {0}")]
    Compile(String),

    #[error("{function}: {message}")]
    Runtime { function: String, message: String },

    #[error("{function}: exceeded its {grace:?} budget")]
    Timeout { function: String, grace: Duration },

    #[error("host is {0:?}")]
    InvalidState(HostState),

    #[error("failed to install script modules: {0}")]
    Modules(String),
}

/// Metric published by a script through `metric.send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricUpdate {
    pub instance: String,
    pub value: String,
}

/// Where `metric.send` values go.
pub type MetricSink = mpsc::Sender<MetricUpdate>;

/// Environment a script sees through the `dev` module.
#[derive(Debug, Clone)]
pub struct HostEnv {
    pub instance: String,
    pub app_dir: PathBuf,
    pub working_dir: PathBuf,
    pub device: DeviceSnapshot,
    pub version: String,
}

/// Host-wide settings shared by every host a supervisor builds.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Budget for any single script call, including `stop`.
    pub grace: Duration,
    pub http: reqwest::Client,
    pub metrics: Option<MetricSink>,
}

impl HostOptions {
    pub fn new(grace: Duration, http: reqwest::Client) -> Self {
        Self {
            grace,
            http,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricSink) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

#[derive(Default)]
struct Watchdog {
    deadline: Mutex<Option<Instant>>,
    tripped: AtomicBool,
}

impl Watchdog {
    fn arm(&self, grace: Duration) {
        self.tripped.store(false, Ordering::Release);
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now() + grace);
    }

    fn disarm(&self) -> bool {
        *self.deadline.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.tripped.swap(false, Ordering::AcqRel)
    }

    fn expired(&self) -> bool {
        let deadline = *self.deadline.lock().unwrap_or_else(PoisonError::into_inner);
        match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.tripped.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }
}

// =============================================================================
// Script Host
// =============================================================================

/// One interpreter instance.
pub struct ScriptHost {
    env: HostEnv,
    options: HostOptions,
    generation: u64,
    lua: Option<Lua>,
    callbacks: Option<Table>,
    state: HostState,
    fingerprint: Option<Fingerprint>,
    bridges: Bridges,
    watchdog: Arc<Watchdog>,
}

/// Wrap `pcall`, `xpcall` and `coroutine.resume` so an expired budget is
/// re-raised after the protected call returns. Without this a script could
/// catch the watchdog error in a loop and never give control back.
fn guard_protected_calls(lua: &Lua, watchdog: &Arc<Watchdog>) -> mlua::Result<()> {
    let globals = lua.globals();
    let coroutine: Table = globals.get("coroutine")?;

    for (table, name) in [(&globals, "pcall"), (&globals, "xpcall"), (&coroutine, "resume")] {
        let original: Function = table.get(name)?;
        let watchdog = Arc::clone(watchdog);
        let guarded = lua.create_function(move |_, args: MultiValue| {
            let results: MultiValue = original.call(args)?;
            if watchdog.expired() {
                return Err(mlua::Error::runtime("script call exceeded its time budget"));
            }
            Ok(results)
        })?;
        table.set(name, guarded)?;
    }
    Ok(())
}

impl ScriptHost {
    /// Create an unloaded host whose bridges post to `sink`.
    pub fn new(env: HostEnv, options: HostOptions, sink: EventSink) -> Self {
        let lua = Lua::new();
        let watchdog = Arc::new(Watchdog::default());

        let hook_watchdog = Arc::clone(&watchdog);
        lua.set_hook(
            HookTriggers::new().every_nth_instruction(WATCHDOG_SLICE),
            move |_lua, _debug| {
                if hook_watchdog.expired() {
                    Err(mlua::Error::runtime("script call exceeded its time budget"))
                } else {
                    Ok(VmState::Continue)
                }
            },
        );

        if let Err(e) = guard_protected_calls(&lua, &watchdog) {
            warn!(instance = %env.instance, error = %e, "Failed to guard protected calls");
        }

        let generation = sink.generation();
        let bridges = Bridges::new(sink, options.http.clone());

        Self {
            env,
            options,
            generation,
            lua: Some(lua),
            callbacks: None,
            state: HostState::Unloaded,
            fingerprint: None,
            bridges,
            watchdog,
        }
    }

    pub fn state(&self) -> HostState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Fingerprint of the loaded content, if a load succeeded.
    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        self.fingerprint.as_ref()
    }

    pub fn instance(&self) -> &str {
        &self.env.instance
    }

    /// Operations still tracked by this host's bridges.
    pub fn pending_operations(&self) -> usize {
        self.bridges.pending()
    }

    /// Compile and run the top-level chunk, capturing the table it returns.
    ///
    /// On failure the host stays `Unloaded` and is inert.
    pub fn load(&mut self, content: &ScriptContent) -> Result<(), HostError> {
        if self.state != HostState::Unloaded {
            return Err(HostError::InvalidState(self.state));
        }
        let Some(lua) = self.lua.as_ref() else {
            return Err(HostError::InvalidState(self.state));
        };

        let chunk = lua
            .load(content.bytes())
            .set_name(format!("={}", self.env.instance));

        self.watchdog.arm(self.options.grace);
        let result = chunk.call::<Value>(());
        let timed_out = self.watchdog.disarm();

        match result {
            Ok(Value::Table(table)) => {
                self.callbacks = Some(table);
            }
            Ok(other) => {
                warn!(
                    instance = %self.env.instance,
                    returned = other.type_name(),
                    "Script returned no callback table; instance is inert"
                );
            }
            Err(e) => {
                let err = self.classify("<chunk>", e, timed_out);
                error!(instance = %self.env.instance, error = %err, "Script load failed");
                return Err(err);
            }
        }

        self.state = HostState::Loaded;
        self.fingerprint = Some(content.fingerprint().clone());
        info!(
            instance = %self.env.instance,
            fingerprint = %content.fingerprint(),
            size = content.len(),
            "Script loaded"
        );
        Ok(())
    }

    /// Install the script modules and call `start`.
    pub fn start(&mut self) -> Result<(), HostError> {
        if self.state != HostState::Loaded {
            return Err(HostError::InvalidState(self.state));
        }
        let Some(lua) = self.lua.as_ref() else {
            return Err(HostError::InvalidState(self.state));
        };

        modules::install(lua, &self.env, &self.bridges, self.options.metrics.clone())
            .map_err(|e| HostError::Modules(e.to_string()))?;

        self.state = HostState::Running;
        self.invoke_named("start", ());
        Ok(())
    }

    /// True if the callback table defines `name` as a function.
    pub fn has_function(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// Call a named callback. Errors are logged, never returned.
    ///
    /// Returns true if the function existed and completed without error.
    pub fn invoke_named(&self, name: &str, args: impl IntoLuaMulti) -> bool {
        let Some(function) = self.lookup(name) else {
            debug!(instance = %self.env.instance, function = name, "No such script function");
            return false;
        };

        match self.call_guarded(name, &function, args) {
            Ok(()) => true,
            Err(err) => {
                error!(instance = %self.env.instance, function = name, error = %err, "Script callback failed");
                false
            }
        }
    }

    /// Dispatch a drained bridge event.
    ///
    /// Events from another generation, events for operations that were
    /// cancelled, and events arriving after stop are dropped. Returns true if
    /// a callback ran.
    pub fn handle_event(&mut self, envelope: Envelope) -> bool {
        if envelope.generation != self.generation {
            debug!(
                instance = %self.env.instance,
                event_generation = envelope.generation,
                generation = self.generation,
                kind = envelope.event.kind(),
                "Dropping stale event"
            );
            return false;
        }
        if self.state != HostState::Running {
            return false;
        }
        let Some(lua) = self.lua.clone() else {
            return false;
        };

        match envelope.event {
            ScriptEvent::Timer { tag, id } => {
                let Some(callback) = self.bridges.timer.on_drained(&tag, id) else {
                    return false;
                };
                self.invoke_named(&callback, tag)
            }
            ScriptEvent::Download {
                tag,
                id,
                file_path,
                md5,
                error,
            } => {
                let Some(callback) = self.bridges.downloader.on_drained(&tag, id) else {
                    return false;
                };
                let args = lua.create_table().and_then(|t| {
                    t.set("tag", tag)?;
                    t.set("filePath", file_path.to_string_lossy().into_owned())?;
                    t.set("md5", md5)?;
                    t.set("err", error)?;
                    Ok(t)
                });
                self.invoke_with_table(&callback, args)
            }
            ScriptEvent::Process {
                name,
                id,
                code,
                success,
                error,
            } => {
                let Some(callback) = self.bridges.process.on_drained(&name, id) else {
                    return false;
                };
                let args = lua.create_table().and_then(|t| {
                    t.set("name", name)?;
                    t.set("code", code)?;
                    t.set("success", success)?;
                    t.set("err", error)?;
                    Ok(t)
                });
                self.invoke_with_table(&callback, args)
            }
        }
    }

    /// Call `stop`, cancel every bridge operation, and close the VM.
    pub fn stop(&mut self) {
        if self.state == HostState::Stopped {
            return;
        }

        if self.state == HostState::Running {
            self.invoke_named("stop", ());
        }

        self.bridges.clear();
        self.callbacks = None;
        self.lua = None;
        self.state = HostState::Stopped;
        info!(instance = %self.env.instance, generation = self.generation, "Script stopped");
    }

    fn lookup(&self, name: &str) -> Option<Function> {
        match self.callbacks.as_ref()?.get::<Value>(name) {
            Ok(Value::Function(function)) => Some(function),
            _ => None,
        }
    }

    fn invoke_with_table(&self, callback: &str, args: mlua::Result<Table>) -> bool {
        match args {
            Ok(table) => self.invoke_named(callback, table),
            Err(e) => {
                error!(instance = %self.env.instance, function = callback, error = %e, "Failed to build callback arguments");
                false
            }
        }
    }

    fn call_guarded(
        &self,
        name: &str,
        function: &Function,
        args: impl IntoLuaMulti,
    ) -> Result<(), HostError> {
        self.watchdog.arm(self.options.grace);
        let result = function.call::<()>(args);
        let timed_out = self.watchdog.disarm();
        result.map_err(|e| self.classify(name, e, timed_out))
    }

    fn classify(&self, function: &str, err: mlua::Error, timed_out: bool) -> HostError {
        if timed_out {
            return HostError::Timeout {
                function: function.to_string(),
                grace: self.options.grace,
            };
        }
        match err {
            mlua::Error::SyntaxError { message, .. } => HostError::Compile(message),
            other => HostError::Runtime {
                function: function.to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl Drop for ScriptHost {
    fn drop(&mut self) {
        if self.state != HostState::Stopped {
            self.bridges.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridges::EVENT_QUEUE_CAPACITY;

    fn env(dir: &std::path::Path) -> HostEnv {
        HostEnv {
            instance: "test".to_string(),
            app_dir: dir.to_path_buf(),
            working_dir: dir.to_path_buf(),
            device: DeviceSnapshot::new().with("os", "linux"),
            version: "0.1.0".to_string(),
        }
    }

    fn host(
        dir: &std::path::Path,
        generation: u64,
    ) -> (ScriptHost, mpsc::Receiver<Envelope>, mpsc::Sender<Envelope>) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let options = HostOptions::new(Duration::from_millis(500), reqwest::Client::new());
        let host = ScriptHost::new(env(dir), options, EventSink::new(tx.clone(), generation));
        (host, rx, tx)
    }

    fn lua_path(path: &std::path::Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    fn recorder_script(log: &std::path::Path) -> String {
        format!(
            r#"
            local LOG = "{log}"
            local function record(line)
                local f = assert(io.open(LOG, "a"))
                f:write(line, "\n")
                f:close()
            end
            local m = {{}}
            function m.start() record("start") end
            function m.stop() record("stop") end
            function m.echo(value) record("echo " .. tostring(value)) end
            function m.boom() error("kaboom") end
            return m
            "#,
            log = lua_path(log)
        )
    }

    fn read_log(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_lifecycle_runs_start_and_stop_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, _rx, _tx) = host(dir.path(), 1);

        host.load(&ScriptContent::from_local(recorder_script(&log)))
            .unwrap();
        assert_eq!(host.state(), HostState::Loaded);
        assert!(host.has_function("echo"));
        assert!(!host.has_function("missing"));

        host.start().unwrap();
        assert_eq!(host.state(), HostState::Running);
        assert!(host.invoke_named("echo", 42));

        host.stop();
        assert_eq!(host.state(), HostState::Stopped);
        assert_eq!(read_log(&log), vec!["start", "echo 42", "stop"]);
    }

    #[tokio::test]
    async fn test_compile_error_leaves_host_inert() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _rx, _tx) = host(dir.path(), 1);

        let err = host
            .load(&ScriptContent::from_local("return {{{"))
            .unwrap_err();
        assert!(matches!(err, HostError::Compile(_)));
        assert_eq!(host.state(), HostState::Unloaded);
        assert!(matches!(host.start(), Err(HostError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_callback_error_is_contained() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, _rx, _tx) = host(dir.path(), 1);

        host.load(&ScriptContent::from_local(recorder_script(&log)))
            .unwrap();
        host.start().unwrap();

        assert!(!host.invoke_named("boom", ()));
        assert!(host.invoke_named("echo", "still alive"));
        assert_eq!(host.state(), HostState::Running);
    }

    #[tokio::test]
    async fn test_hung_stop_hook_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _rx, _tx) = host(dir.path(), 1);
        let script = r#"
            local m = {}
            function m.start() end
            function m.stop() while true do end end
            return m
        "#;

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();

        let started = Instant::now();
        host.stop();
        assert_eq!(host.state(), HostState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_hung_stop_hook_cannot_swallow_the_budget() {
        let dir = tempfile::tempdir().unwrap();
        let (mut host, _rx, _tx) = host(dir.path(), 1);
        let script = r#"
            local m = {}
            function m.start() end
            function m.stop()
                while true do
                    pcall(function() while true do end end)
                    xpcall(function() while true do end end, function(e) return e end)
                    coroutine.resume(coroutine.create(function() while true do end end))
                end
            end
            return m
        "#;

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();

        let started = Instant::now();
        host.stop();
        assert_eq!(host.state(), HostState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pcall_still_catches_ordinary_errors() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, _rx, _tx) = host(dir.path(), 1);
        let script = format!(
            r#"
            local m = {{}}
            function m.start()
                local ok, err = pcall(error, "boom")
                local f = io.open('{}', 'w')
                f:write(tostring(ok), ' ', tostring(err))
                f:close()
            end
            return m
        "#,
            lua_path(&log)
        );

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();
        host.stop();

        assert_eq!(std::fs::read_to_string(&log).unwrap(), "false boom");
    }

    #[tokio::test]
    async fn test_timer_event_dispatches_with_tag() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, mut rx, _tx) = host(dir.path(), 1);
        let script = format!(
            r#"
            local LOG = "{log}"
            local m = {{}}
            function m.start()
                local timer = require("timer")
                assert(timer.register("t1", 0.01, "on_timer", true))
            end
            function m.on_timer(tag)
                local f = assert(io.open(LOG, "a"))
                f:write("fired ", tag, "\n")
                f:close()
            end
            return m
            "#,
            log = lua_path(&log)
        );

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();

        let envelope = rx.recv().await.unwrap();
        assert!(host.handle_event(envelope));
        assert_eq!(read_log(&log), vec!["fired t1"]);
        assert_eq!(host.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_stale_timer_event_dropped_after_reload() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let script = format!(
            r#"
            local LOG = "{log}"
            local m = {{}}
            function m.start()
                require("timer").register("T", 0.01, "on_timer")
            end
            function m.on_timer(tag)
                local f = assert(io.open(LOG, "a"))
                f:write("fired ", tag, "\n")
                f:close()
            end
            return m
            "#,
            log = lua_path(&log)
        );

        let (tx, mut rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let options = HostOptions::new(Duration::from_secs(1), reqwest::Client::new());

        let mut old = ScriptHost::new(env(dir.path()), options.clone(), EventSink::new(tx.clone(), 1));
        old.load(&ScriptContent::from_local(script.clone())).unwrap();
        old.start().unwrap();
        let stale = rx.recv().await.unwrap();
        old.stop();

        let mut new = ScriptHost::new(env(dir.path()), options, EventSink::new(tx, 2));
        new.load(&ScriptContent::from_local(script)).unwrap();
        new.start().unwrap();

        assert!(!new.handle_event(stale));
        assert!(read_log(&log).is_empty());
        new.stop();
    }

    #[tokio::test]
    async fn test_duplicate_tag_returned_to_script() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, _rx, _tx) = host(dir.path(), 1);
        let script = format!(
            r#"
            local LOG = "{log}"
            local m = {{}}
            function m.start()
                local timer = require("timer")
                timer.register("dup", 60, "noop")
                local ok, err = timer.register("dup", 60, "noop")
                local f = assert(io.open(LOG, "a"))
                f:write(tostring(ok), " ", tostring(err ~= nil), "\n")
                f:close()
            end
            function m.noop() end
            return m
            "#,
            log = lua_path(&log)
        );

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();
        assert_eq!(read_log(&log), vec!["nil true"]);
        host.stop();
        assert_eq!(host.pending_operations(), 0);
    }

    #[tokio::test]
    async fn test_dev_module_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("log.txt");
        let (mut host, _rx, _tx) = host(dir.path(), 1);
        let script = format!(
            r#"
            local LOG = "{log}"
            local m = {{}}
            function m.start()
                local dev = require("dev")
                local ok = pcall(function() dev.os = "other" end)
                local f = assert(io.open(LOG, "a"))
                f:write(dev.os, " ", dev.instance, " ", tostring(ok), "\n")
                f:close()
            end
            return m
            "#,
            log = lua_path(&log)
        );

        host.load(&ScriptContent::from_local(script)).unwrap();
        host.start().unwrap();
        assert_eq!(read_log(&log), vec!["linux test false"]);
    }
}
