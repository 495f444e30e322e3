//! Atomic Lua scripts for the Redis backend
//!
//! All multi-key mutations of the queue triplet (ready list, delayed sorted
//! set, reserved sorted set) run server-side so that reservation stays atomic
//! across competing worker processes. The key and argument arities below are
//! part of the wire contract shared with existing deployments, as are the
//! JSON field names the pop script touches.

use redis::Script;

/// Compute the total backlog of a queue.
///
/// KEYS[1] - the ready list
/// KEYS[2] - the delayed sorted set
/// KEYS[3] - the reserved sorted set
const SIZE: &str = r#"
return redis.call('llen', KEYS[1]) + redis.call('zcard', KEYS[2]) + redis.call('zcard', KEYS[3])
"#;

/// Reserve-pop the head of the ready list.
///
/// KEYS[1] - the ready list
/// KEYS[2] - the reserved sorted set
/// ARGV[1] - current unix time in seconds
///
/// Returns {raw, reserved}: the entry as popped and the re-encoded copy that
/// was placed in the reserved set, or {false, false} when the list is empty.
const POP: &str = r#"
local job = redis.call('lpop', KEYS[1])
local reserved = false
local timeoutAt = 0

if(job ~= false) then
    reserved = cjson.decode(job)
    -- the first reservation fixes the pop time
    if reserved['PopTime'] <= 0 then
        reserved['PopTime'] = tonumber(ARGV[1])
    end
    timeoutAt = tonumber(ARGV[1]) + tonumber(reserved['Timeout'])
    reserved['Attempts'] = reserved['Attempts'] + 1
    reserved['TimeoutAt'] = timeoutAt
    reserved = cjson.encode(reserved)
    redis.call('zadd', KEYS[2], timeoutAt, reserved)
end

return {job, reserved}
"#;

/// Move a reserved entry into the delayed set for a later retry.
///
/// KEYS[1] - the delayed sorted set
/// KEYS[2] - the reserved sorted set
/// ARGV[1] - the reserved entry, byte-exact as returned by pop
/// ARGV[2] - unix time at which the entry becomes eligible
const RELEASE: &str = r#"
redis.call('zrem', KEYS[2], ARGV[1])
redis.call('zadd', KEYS[1], ARGV[2], ARGV[1])
return true
"#;

/// Move every entry whose score has expired onto the tail of the ready list.
///
/// KEYS[1] - the source sorted set (delayed or reserved)
/// KEYS[2] - the destination ready list
/// ARGV[1] - current unix time in seconds
///
/// Entries are removed by rank and pushed in chunks of 100 to bound the
/// per-call latency on large backlogs.
const MIGRATE: &str = r#"
local val = redis.call('zrangebyscore', KEYS[1], '-inf', ARGV[1])

if(next(val) ~= nil) then
    redis.call('zremrangebyrank', KEYS[1], 0, #val - 1)

    for i = 1, #val, 100 do
        redis.call('rpush', KEYS[2], unpack(val, i, math.min(i+99, #val)))
    end
end

return val
"#;

/// Prepared scripts shared by the Redis backend and its job handles.
pub(crate) struct LuaScripts {
    pub(crate) size: Script,
    pub(crate) pop: Script,
    pub(crate) release: Script,
    pub(crate) migrate: Script,
}

impl LuaScripts {
    pub(crate) fn new() -> Self {
        Self {
            size: Script::new(SIZE),
            pop: Script::new(POP),
            release: Script::new(RELEASE),
            migrate: Script::new(MIGRATE),
        }
    }
}
