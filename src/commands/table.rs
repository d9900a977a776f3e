//! Command Table
//!
//! The static list of commands the proxy understands. Each entry says how
//! many arguments the command takes, whether the proxy answers it itself or
//! forwards it, and which argument is the routing key.
//!
//! ## Arity
//!
//! Arity counts the command name, Redis style:
//!
//! - `N > 0`: exactly N arguments (`GET key` is 2)
//! - `-N`: at least N arguments (`SET key value [EX s]` is -3)
//!
//! Commands that accept several keys in Redis (`DEL`, `EXISTS`, `MGET`,
//! `UNLINK`) are listed with an exact arity of 2. Their keys could live on
//! different shards and the proxy does not merge replies.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Where a command is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// Answered by the proxy.
    Local,
    /// Sent to the backend owning the routing key.
    Forward,
}

/// One row of the command table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSpec {
    /// Lower-case command name
    pub name: &'static str,
    pub arity: i32,
    pub kind: CommandKind,
    /// Position of the routing key in the argument list (forwarded only)
    pub key_index: usize,
}

impl CommandSpec {
    const fn local(name: &'static str, arity: i32) -> Self {
        Self {
            name,
            arity,
            kind: CommandKind::Local,
            key_index: 0,
        }
    }

    const fn forward(name: &'static str, arity: i32) -> Self {
        Self {
            name,
            arity,
            kind: CommandKind::Forward,
            key_index: 1,
        }
    }

    /// Checks an argument count (command name included) against the arity.
    pub fn accepts(&self, argc: usize) -> bool {
        let argc = argc as i64;
        let arity = i64::from(self.arity);
        if arity >= 0 {
            argc == arity
        } else {
            argc >= -arity
        }
    }
}

#[rustfmt::skip]
const COMMANDS: &[CommandSpec] = &[
    // Proxy
    CommandSpec::local("ping", -1),
    CommandSpec::local("echo", 2),
    CommandSpec::local("info", -1),
    CommandSpec::local("command", -1),
    CommandSpec::local("time", 1),
    CommandSpec::local("quit", 1),

    // Strings
    CommandSpec::forward("get", 2),
    CommandSpec::forward("set", -3),
    CommandSpec::forward("setnx", 3),
    CommandSpec::forward("setex", 4),
    CommandSpec::forward("psetex", 4),
    CommandSpec::forward("getset", 3),
    CommandSpec::forward("getdel", 2),
    CommandSpec::forward("append", 3),
    CommandSpec::forward("strlen", 2),
    CommandSpec::forward("incr", 2),
    CommandSpec::forward("incrby", 3),
    CommandSpec::forward("incrbyfloat", 3),
    CommandSpec::forward("decr", 2),
    CommandSpec::forward("decrby", 3),
    CommandSpec::forward("getrange", 4),
    CommandSpec::forward("setrange", 4),
    CommandSpec::forward("mget", 2),

    // Keys
    CommandSpec::forward("del", 2),
    CommandSpec::forward("unlink", 2),
    CommandSpec::forward("exists", 2),
    CommandSpec::forward("type", 2),
    CommandSpec::forward("expire", 3),
    CommandSpec::forward("pexpire", 3),
    CommandSpec::forward("expireat", 3),
    CommandSpec::forward("pexpireat", 3),
    CommandSpec::forward("ttl", 2),
    CommandSpec::forward("pttl", 2),
    CommandSpec::forward("persist", 2),

    // Lists
    CommandSpec::forward("lpush", -3),
    CommandSpec::forward("rpush", -3),
    CommandSpec::forward("lpushx", -3),
    CommandSpec::forward("rpushx", -3),
    CommandSpec::forward("lpop", -2),
    CommandSpec::forward("rpop", -2),
    CommandSpec::forward("llen", 2),
    CommandSpec::forward("lindex", 3),
    CommandSpec::forward("lrange", 4),
    CommandSpec::forward("lset", 4),
    CommandSpec::forward("lrem", 4),
    CommandSpec::forward("ltrim", 4),
    CommandSpec::forward("linsert", 5),

    // Hashes
    CommandSpec::forward("hset", -4),
    CommandSpec::forward("hsetnx", 4),
    CommandSpec::forward("hget", 3),
    CommandSpec::forward("hmset", -4),
    CommandSpec::forward("hmget", -3),
    CommandSpec::forward("hdel", -3),
    CommandSpec::forward("hexists", 3),
    CommandSpec::forward("hlen", 2),
    CommandSpec::forward("hkeys", 2),
    CommandSpec::forward("hvals", 2),
    CommandSpec::forward("hgetall", 2),
    CommandSpec::forward("hincrby", 4),
    CommandSpec::forward("hincrbyfloat", 4),
    CommandSpec::forward("hstrlen", 3),

    // Sets
    CommandSpec::forward("sadd", -3),
    CommandSpec::forward("srem", -3),
    CommandSpec::forward("smembers", 2),
    CommandSpec::forward("sismember", 3),
    CommandSpec::forward("scard", 2),
    CommandSpec::forward("spop", -2),
    CommandSpec::forward("srandmember", -2),

    // Sorted sets
    CommandSpec::forward("zadd", -4),
    CommandSpec::forward("zrem", -3),
    CommandSpec::forward("zscore", 3),
    CommandSpec::forward("zincrby", 4),
    CommandSpec::forward("zcard", 2),
    CommandSpec::forward("zcount", 4),
    CommandSpec::forward("zrank", 3),
    CommandSpec::forward("zrevrank", 3),
    CommandSpec::forward("zrange", -4),
    CommandSpec::forward("zrevrange", -4),
    CommandSpec::forward("zrangebyscore", -4),
    CommandSpec::forward("zrevrangebyscore", -4),
    CommandSpec::forward("zremrangebyrank", 4),
    CommandSpec::forward("zremrangebyscore", 4),
];

fn index() -> &'static HashMap<&'static str, &'static CommandSpec> {
    static INDEX: OnceLock<HashMap<&'static str, &'static CommandSpec>> = OnceLock::new();
    INDEX.get_or_init(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect())
}

/// Looks up a command by its lower-case name.
pub fn lookup(name: &str) -> Option<&'static CommandSpec> {
    index().get(name).copied()
}

/// Every known command, in table order.
pub fn all() -> &'static [CommandSpec] {
    COMMANDS
}
