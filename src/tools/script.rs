//! 内置 Lua 脚本引擎
//!
//! 供 `EXEC:` 命令与 `/execute` 使用。每次执行创建一个独立的 Lua 状态（只加载 string/math/table/utf8 库），
//! 在阻塞线程池中运行：
//! - 全局 `print(a, b, ...)` 被替换为经 Hub 广播，每个参数一行；
//! - 脚本先按表达式（`return <script>`）编译，失败再按语句块编译，与 Lua 交互式解释器一致；
//! - 有返回值时输出为各返回值的 tostring（以制表符分隔），否则输出固定的成功提示；
//! - 指令钩子在截止时间到达后中断执行，死循环不会占住线程。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use mlua::{Function, HookTriggers, Lua, LuaOptions, MultiValue, StdLib, Value, Variadic, VmState};

use super::{ScriptError, ScriptExecutor};
use crate::gateway::HubHandle;

/// 没有返回值时的输出
pub const DEFAULT_OUTPUT: &str = "Script executed successfully";

/// 每执行这么多条指令检查一次截止时间
const HOOK_INSTRUCTIONS: u32 = 10_000;

/// 单个脚本可用的内存上限
const MEMORY_LIMIT: usize = 64 * 1024 * 1024;

const CHUNK_NAME: &str = "=script";

/// Lua 引擎；print 输出经由 Hub 广播
pub struct LuaEngine {
    relay: HubHandle,
    limit: Duration,
}

impl LuaEngine {
    pub fn new(relay: HubHandle, limit: Duration) -> Self {
        Self { relay, limit }
    }
}

#[async_trait]
impl ScriptExecutor for LuaEngine {
    fn name(&self) -> &str {
        "lua"
    }

    async fn execute(&self, script: &str) -> Result<String, ScriptError> {
        let relay = self.relay.clone();
        let limit = self.limit;
        let script = script.to_string();

        tokio::task::spawn_blocking(move || {
            evaluate(&script, limit, move |line| relay.broadcast(line))
        })
        .await
        .map_err(|e| ScriptError::Runtime(format!("script task failed: {}", e)))?
    }
}

/// 在当前线程执行整段脚本；`emit` 接收 print 产生的每一行
pub fn evaluate<F>(script: &str, limit: Duration, emit: F) -> Result<String, ScriptError>
where
    F: Fn(String) + 'static,
{
    let deadline = Instant::now() + limit;
    let lua = new_state(emit, deadline).map_err(|e| ScriptError::Runtime(e.to_string()))?;

    let expression = format!("return {}", script);
    let result = match lua.load(expression.as_str()).set_name(CHUNK_NAME).into_function() {
        Ok(function) => function.call::<MultiValue>(()),
        Err(_) => lua
            .load(script)
            .set_name(CHUNK_NAME)
            .into_function()
            .and_then(|function| function.call::<MultiValue>(())),
    };

    match result {
        Ok(values) => render(&lua, values).map_err(|e| ScriptError::Runtime(e.to_string())),
        Err(_) if Instant::now() >= deadline => Err(ScriptError::Timeout(limit)),
        Err(e) => Err(classify(e)),
    }
}

fn new_state<F>(emit: F, deadline: Instant) -> mlua::Result<Lua>
where
    F: Fn(String) + 'static,
{
    let lua = Lua::new_with(
        StdLib::STRING | StdLib::MATH | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    lua.set_memory_limit(MEMORY_LIMIT)?;

    let print = lua.create_function(move |lua, args: Variadic<Value>| {
        let tostring: Function = lua.globals().get("tostring")?;
        for value in args.iter() {
            let line: String = tostring.call(value.clone())?;
            emit(line);
        }
        Ok(())
    })?;
    lua.globals().set("print", print)?;

    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTIONS),
        move |_lua, _debug| {
            if Instant::now() >= deadline {
                Err(mlua::Error::runtime("script deadline exceeded"))
            } else {
                Ok(VmState::Continue)
            }
        },
    );

    Ok(lua)
}

/// 返回值按 tostring 转换后以制表符连接；没有返回值时为固定提示
fn render(lua: &Lua, values: MultiValue) -> mlua::Result<String> {
    if values.is_empty() {
        return Ok(DEFAULT_OUTPUT.to_string());
    }
    let tostring: Function = lua.globals().get("tostring")?;
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        let part: String = tostring.call(value)?;
        parts.push(part);
    }
    Ok(parts.join("\t"))
}

/// 错误消息只保留首行（去掉 traceback），结果要作为单行广播
fn classify(e: mlua::Error) -> ScriptError {
    match e {
        mlua::Error::SyntaxError { message, .. } => ScriptError::Syntax(first_line(&message)),
        mlua::Error::RuntimeError(message) | mlua::Error::MemoryError(message) => {
            ScriptError::Runtime(first_line(&message))
        }
        mlua::Error::CallbackError { cause, .. } => classify((*cause).clone()),
        other => ScriptError::Runtime(first_line(&other.to_string())),
    }
}

fn first_line(message: &str) -> String {
    message.lines().next().unwrap_or_default().trim_end().to_string()
}
