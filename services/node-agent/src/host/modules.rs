//! Script-facing modules, installed into `package.loaded`.
//!
//! Bridge functions return `true` on success and `nil, err` on failure, so
//! scripts can write `assert(timer.register(...))` or handle the error.

use std::path::PathBuf;
use std::time::Duration;

use mlua::{Lua, Table, Value, Variadic};
use tracing::{debug, info};

use super::{HostEnv, MetricSink, MetricUpdate};
use crate::bridges::{BridgeError, Bridges, DownloadBridge, ProcessBridge, ProcessCommand, TimerBridge};

type Outcome = (Option<bool>, Option<String>);

fn outcome(result: Result<(), BridgeError>) -> Outcome {
    match result {
        Ok(()) => (Some(true), None),
        Err(e) => (None, Some(e.to_string())),
    }
}

pub(super) fn install(
    lua: &Lua,
    env: &HostEnv,
    bridges: &Bridges,
    metrics: Option<MetricSink>,
) -> mlua::Result<()> {
    let package: Table = lua.globals().get("package")?;
    let loaded: Table = package.get("loaded")?;

    loaded.set("timer", timer_module(lua, bridges.timer.clone())?)?;
    loaded.set(
        "downloader",
        downloader_module(lua, bridges.downloader.clone(), env.app_dir.clone())?,
    )?;
    loaded.set("process", process_module(lua, bridges.process.clone())?)?;
    loaded.set("metric", metric_module(lua, env.instance.clone(), metrics)?)?;
    loaded.set("dev", dev_module(lua, env)?)?;

    lua.globals().set("print", print_function(lua, env.instance.clone())?)?;
    Ok(())
}

fn timer_module(lua: &Lua, timers: TimerBridge) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let bridge = timers.clone();
    module.set(
        "register",
        lua.create_function(
            move |_, (tag, seconds, callback, once): (String, f64, String, Option<bool>)| {
                let period = match Duration::try_from_secs_f64(seconds) {
                    Ok(period) => period,
                    Err(_) => return Ok((None, Some(format!("timer: invalid period {}", seconds)))),
                };
                Ok(outcome(bridge.register(
                    &tag,
                    period,
                    &callback,
                    once.unwrap_or(false),
                )))
            },
        )?,
    )?;

    let bridge = timers.clone();
    module.set(
        "cancel",
        lua.create_function(move |_, tag: String| Ok(bridge.cancel(&tag)))?,
    )?;

    let bridge = timers;
    module.set(
        "has",
        lua.create_function(move |_, tag: String| Ok(bridge.has(&tag)))?,
    )?;

    Ok(module)
}

fn downloader_module(lua: &Lua, downloads: DownloadBridge, app_dir: PathBuf) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let bridge = downloads.clone();
    module.set(
        "fetch",
        lua.create_function(
            move |_, (tag, url, dest, callback): (String, String, String, String)| {
                let dest = PathBuf::from(dest);
                let dest = if dest.is_relative() {
                    app_dir.join(dest)
                } else {
                    dest
                };
                Ok(outcome(bridge.fetch(&tag, &url, dest, &callback)))
            },
        )?,
    )?;

    let bridge = downloads;
    module.set(
        "cancel",
        lua.create_function(move |_, tag: String| Ok(bridge.cancel(&tag)))?,
    )?;

    Ok(module)
}

fn process_module(lua: &Lua, processes: ProcessBridge) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    let bridge = processes.clone();
    module.set(
        "spawn",
        lua.create_function(
            move |lua, (name, command, callback): (String, Value, String)| {
                let command = match command {
                    Value::Table(argv) => ProcessCommand::Argv(
                        argv.sequence_values::<String>()
                            .collect::<mlua::Result<Vec<_>>>()?,
                    ),
                    other => ProcessCommand::Shell(lua.unpack::<String>(other)?),
                };
                Ok(outcome(bridge.spawn(&name, command, &callback)))
            },
        )?,
    )?;

    let bridge = processes.clone();
    module.set(
        "kill",
        lua.create_function(move |_, name: String| Ok(bridge.kill(&name)))?,
    )?;

    let bridge = processes;
    module.set(
        "running",
        lua.create_function(move |_, name: String| Ok(bridge.running(&name)))?,
    )?;

    Ok(module)
}

fn metric_module(lua: &Lua, instance: String, metrics: Option<MetricSink>) -> mlua::Result<Table> {
    let module = lua.create_table()?;

    module.set(
        "send",
        lua.create_function(move |_, value: String| {
            if let Some(sink) = &metrics {
                let update = MetricUpdate {
                    instance: instance.clone(),
                    value,
                };
                if sink.try_send(update).is_err() {
                    debug!(instance = %instance, "Metric dropped, reporter busy");
                }
            }
            Ok(())
        })?,
    )?;

    Ok(module)
}

/// Read-only view of the device snapshot plus instance details.
fn dev_module(lua: &Lua, env: &HostEnv) -> mlua::Result<Table> {
    let data = lua.create_table()?;
    for (key, value) in env.device.iter() {
        data.set(key, value)?;
    }
    data.set("appDir", env.app_dir.to_string_lossy().into_owned())?;
    data.set("workingDir", env.working_dir.to_string_lossy().into_owned())?;
    data.set("instance", env.instance.clone())?;
    data.set("version", env.version.clone())?;

    let meta = lua.create_table()?;
    meta.set("__index", data)?;
    meta.set(
        "__newindex",
        lua.create_function(|_, _: Variadic<Value>| -> mlua::Result<()> {
            Err(mlua::Error::runtime("dev is read-only"))
        })?,
    )?;
    meta.set("__metatable", false)?;

    let proxy = lua.create_table()?;
    proxy.set_metatable(Some(meta));
    Ok(proxy)
}

/// `print` routed through tracing, tagged with the instance name.
fn print_function(lua: &Lua, instance: String) -> mlua::Result<mlua::Function> {
    lua.create_function(move |_, args: Variadic<Value>| {
        let line = args
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join("\t");
        info!(instance = %instance, output = %line, "Script output");
        Ok(())
    })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Nil => "nil".to_string(),
        Value::Boolean(b) => b.to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("{}", s.to_string_lossy()),
        other => other.type_name().to_string(),
    }
}
