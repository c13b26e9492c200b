// src/lua.rs - Lua scripts for atomic operations
use redis::Script;

pub struct LuaScripts {
    pub add_job: Script,
    pub claim_job: Script,
    pub move_delayed: Script,
    pub finish_job: Script,
    pub retry_job: Script,
    pub fire_repeatable: Script,
    pub update_progress: Script,
}

impl LuaScripts {
    pub fn new() -> Self {
        // Scripts run via EVALSHA and are loaded on the first NOSCRIPT reply.
        Self {
            add_job: Script::new(include_str!("./lua/add_job.lua")),
            claim_job: Script::new(include_str!("./lua/claim_job.lua")),
            move_delayed: Script::new(include_str!("./lua/move_delayed.lua")),
            finish_job: Script::new(include_str!("./lua/finish_job.lua")),
            retry_job: Script::new(include_str!("./lua/retry_job.lua")),
            fire_repeatable: Script::new(include_str!("./lua/fire_repeatable.lua")),
            update_progress: Script::new(include_str!("./lua/update_progress.lua")),
        }
    }
}

impl Default for LuaScripts {
    fn default() -> Self {
        Self::new()
    }
}
