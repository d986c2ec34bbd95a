//! Server-side Lua scripts implementing every atomic state transition.
//!
//! Transliterated from `examples/original_source/lua.go`, preserving exact
//! semantics (including the `JSON.*` calls against the store's JSON module) so the
//! on-wire task documents stay bit-compatible with the original. Scripts are
//! loaded once per process and cached by the server via SHA (the `redis` crate's
//! [`redis::Script`] does this transparently, falling back to `EVAL` on a cache
//! miss).

use once_cell::sync::Lazy;
use redis::Script;

/// KEYS[1] pending, KEYS[2..] task keys. ARGV[1..] task JSON documents.
pub static ENQUEUE_PENDING: Lazy<Script> = Lazy::new(|| Script::new(ENQUEUE_PENDING_SRC));
const ENQUEUE_PENDING_SRC: &str = r#"
local pending = KEYS[1]
for i = 1, #ARGV do
    redis.call('JSON.SET', KEYS[i + 1], '$', ARGV[i])
    redis.call('LPUSH', pending, KEYS[i + 1])
end
return redis.status_reply('OK')
"#;

/// KEYS[1] scheduled, KEYS[2..] task keys. ARGV[1..] task JSON documents.
pub static ENQUEUE_SCHEDULED: Lazy<Script> = Lazy::new(|| Script::new(ENQUEUE_SCHEDULED_SRC));
const ENQUEUE_SCHEDULED_SRC: &str = r#"
local scheduled = KEYS[1]
for i = 1, #ARGV do
    redis.call('JSON.SET', KEYS[i + 1], '$', ARGV[i])
    local startAt = string.match(ARGV[i], '"start_at":%s*(%d+)')
    if startAt then
        redis.call('ZADD', scheduled, startAt, KEYS[i + 1])
    end
end
return redis.status_reply('OK')
"#;

/// KEYS[1] pending, KEYS[2] active, KEYS[3] scheduled, KEYS[4] retry.
/// ARGV[1] count, ARGV[2] pending-state bitmask, ARGV[3] active-state bitmask.
/// Returns an array of task JSON documents.
pub static PICK_TASKS: Lazy<Script> = Lazy::new(|| Script::new(PICK_TASKS_SRC));
const PICK_TASKS_SRC: &str = r#"
local pending = KEYS[1]
local active = KEYS[2]
local scheduled = KEYS[3]
local retry = KEYS[4]
local count = tonumber(ARGV[1])
local now = tonumber(redis.call('TIME')[1])
local pendingState = ARGV[2]
local activeState = ARGV[3]

local move1 = redis.call('ZRANGEBYSCORE', scheduled, 0, now)
if #move1 > 0 then
    redis.call('LPUSH', pending, unpack(move1))
    for i = 1, #move1 do
        redis.call('JSON.MSET', move1[i], '$.pending_at', now, move1[i], '$.state', pendingState)
    end
    redis.call('ZREM', scheduled, unpack(move1))
end
local move2 = redis.call('ZRANGEBYSCORE', retry, 0, now)
if #move2 > 0 then
    redis.call('LPUSH', pending, unpack(move2))
    for i = 1, #move2 do
        redis.call('JSON.MSET', move2[i], '$.pending_at', now, move2[i], '$.state', pendingState)
    end
    redis.call('ZREM', retry, unpack(move2))
end
local result = {}
for _ = 1, count do
    local taskKey = redis.call('RPOPLPUSH', pending, active)
    if not taskKey then
        return result
    end
    redis.call('JSON.MSET', taskKey, '$.pending_at', now, taskKey, '$.state', activeState)
    local task = redis.call('JSON.GET', taskKey)
    if task then
        table.insert(result, task)
    end
end
return result
"#;

/// KEYS[1] retry, KEYS[2] active, KEYS[3..] task keys.
/// ARGV[1] retried-state bitmask, then pairs of (pending_at, retried_count) per task.
pub static RETRY_TASKS: Lazy<Script> = Lazy::new(|| Script::new(RETRY_TASKS_SRC));
const RETRY_TASKS_SRC: &str = r#"
local retry = KEYS[1]
local active = KEYS[2]
local retryState = ARGV[1]
local j = 2
for i = 3, #KEYS do
    local taskKey = KEYS[i]
    local score = tonumber(ARGV[j])
    local retriedCount = tonumber(ARGV[j + 1])
    j = j + 2
    redis.call('ZADD', retry, score, taskKey)
    redis.call('JSON.MSET', taskKey, '$.state', retryState, taskKey, '$.retried', retriedCount)
    redis.call('LREM', active, 1, taskKey)
end
return redis.status_reply('OK')
"#;

/// KEYS[1] pending, KEYS[2] active, KEYS[3..] task keys.
pub static ACTIVE_TO_PENDING: Lazy<Script> = Lazy::new(|| Script::new(ACTIVE_TO_PENDING_SRC));
const ACTIVE_TO_PENDING_SRC: &str = r#"
local pending = KEYS[1]
local active = KEYS[2]
local now = tonumber(redis.call('TIME')[1])

redis.call('LPUSH', pending, unpack(KEYS, 3, #KEYS))
for i = 3, #KEYS do
    redis.call('LREM', active, 1, KEYS[i])
    redis.call('JSON.SET', KEYS[i], '$.pending_at', now)
end
return redis.status_reply('OK')
"#;

/// KEYS[1] archive list (success or failed), KEYS[2] active, KEYS[3] todel,
/// KEYS[4..] task keys. ARGV[1] archived-state bitmask, ARGV[2..] per-task retention.
pub static ACTIVE_TO_ARCHIVE: Lazy<Script> = Lazy::new(|| Script::new(ACTIVE_TO_ARCHIVE_SRC));
const ACTIVE_TO_ARCHIVE_SRC: &str = r#"
local archive = KEYS[1]
local active = KEYS[2]
local todel = KEYS[3]
local state = ARGV[1]
local now = tonumber(redis.call('TIME')[1])

for i = 2, #ARGV do
    local taskKey = KEYS[i + 2]
    local retention = tonumber(ARGV[i])
    if retention ~= 0 then
        redis.call('LPUSH', archive, taskKey)
        if retention > 0 then
            redis.call('EXPIRE', taskKey, retention)
            redis.call('ZADD', todel, now + retention, taskKey)
        end
        redis.call('JSON.MSET', taskKey, '$.completed_at', now, taskKey, '$.state', state)
    else
        redis.call('DEL', taskKey)
    end
    redis.call('LREM', active, 1, taskKey)
end
return redis.status_reply('OK')
"#;

/// KEYS[1] active, KEYS[2] live, KEYS[3] pending.
/// ARGV[1] idle threshold in seconds, ARGV[2] pending-state bitmask.
pub static RECOVERY: Lazy<Script> = Lazy::new(|| Script::new(RECOVERY_SRC));
const RECOVERY_SRC: &str = r#"
local function pendingAt(task, active)
    local resp = redis.call('JSON.GET', task, '$.pending_at')
    if resp then
        if string.len(resp) > 2 then
            return string.sub(resp, 2, string.len(resp) - 1)
        end
    else
        redis.call('LREM', active, 1, task)
    end
end
local function toActiveTable(l, active)
    local result = {}
    for i = 1, #l do
        local score = pendingAt(l[i], active)
        if score then
            result[l[i]] = score
        end
    end
    return result
end
local function set2Table(s)
    local result = {}
    for i = 1, #s, 2 do
        result[s[i]] = s[i + 1]
    end
    return result
end
local function zombieActive(set1, set2, timeout, now)
    local result = {}
    for key in pairs(set1) do
        if not set2[key] then
            if now - tonumber(set1[key]) > timeout then
                table.insert(result, key)
            end
        end
    end
    return result
end
local function zombieLive(set1, set2)
    local result = {}
    for key in pairs(set1) do
        if not set2[key] then
            table.insert(result, key)
        end
    end
    return result
end
local function idleActive(set1, set2, timeout, now)
    local result = {}
    for key in pairs(set1) do
        if set2[key] then
            local score1 = tonumber(set1[key])
            local score2 = tonumber(set2[key])
            local score = score2
            if score1 > score2 then
                score = score1
            end
            if now - score > timeout then
                table.insert(result, key)
            end
        end
    end
    return result
end
local active = KEYS[1]
local live = KEYS[2]
local pending = KEYS[3]
local duration = tonumber(ARGV[1])
local pendingState = ARGV[2]
local liveSet = redis.call('ZRANGE', live, 0, -1, 'WITHSCORES')
local activeList = redis.call('LRANGE', active, 0, -1)
if #activeList > 0 then
    local now = tonumber(redis.call('TIME')[1])
    local activeTable = toActiveTable(activeList, active)
    local liveTable = set2Table(liveSet)
    local del1 = zombieActive(activeTable, liveTable, duration, now)
    local del2 = idleActive(activeTable, liveTable, duration, now)
    if #del1 > 0 then
        redis.call('LPUSH', pending, unpack(del1))
        for i = 1, #del1 do
            redis.call('JSON.MSET', del1[i], '$.state', pendingState, del1[i], '$.pending_at', now)
            redis.call('LREM', active, 1, del1[i])
        end
    end
    if #del2 > 0 then
        redis.call('LPUSH', pending, unpack(del2))
        for i = 1, #del2 do
            redis.call('JSON.MSET', del2[i], '$.state', pendingState, del2[i], '$.pending_at', now)
            redis.call('LREM', active, 1, del2[i])
        end
        redis.call('ZREM', live, unpack(del2))
    end
    local del3 = zombieLive(liveTable, activeTable)
    if #del3 > 0 then
        redis.call('ZREM', live, unpack(del3))
    end
    return redis.status_reply('OK')
end
redis.call('DEL', live)
return redis.status_reply('OK')
"#;

/// KEYS[1] todel, KEYS[2] successful, KEYS[3] failed.
/// ARGV[1] successful start pos, ARGV[2] successful end pos,
/// ARGV[3] failed start pos, ARGV[4] failed end pos.
/// Returns {nextSuccessPos, nextFailedPos}; 0 means that list is fully drained for
/// this pass. Each list paginates independently (see DESIGN.md — the original's
/// shared cursor between three interleaved scans was ambiguous).
pub static CLEANER: Lazy<Script> = Lazy::new(|| Script::new(CLEANER_SRC));
const CLEANER_SRC: &str = r#"
local todel = KEYS[1]
local successList = KEYS[2]
local failedList = KEYS[3]
local successStart = tonumber(ARGV[1])
local successEnd = tonumber(ARGV[2])
local failedStart = tonumber(ARGV[3])
local failedEnd = tonumber(ARGV[4])
local now = tonumber(redis.call('TIME')[1])
local nextSuccess = 0
local nextFailed = 0

if successStart == 0 and failedStart == 0 then
    local expired = redis.call('ZRANGEBYSCORE', todel, 0, now)
    if #expired > 0 then
        for j = 1, #expired do
            local taskKey = expired[j]
            if redis.call('LREM', successList, 1, taskKey) == 0 then
                redis.call('LREM', failedList, 1, taskKey)
            end
        end
        redis.call('ZREM', todel, unpack(expired))
    end
end

local successLen = tonumber(redis.call('LLEN', successList))
if successLen > successStart then
    local page = redis.call('LRANGE', successList, successStart, successEnd)
    for _, taskKey in ipairs(page) do
        if redis.call('EXISTS', taskKey) == 0 then
            redis.call('LREM', successList, 1, taskKey)
        end
    end
    if successEnd + 1 < successLen then
        nextSuccess = successEnd + 1
    end
end

local failedLen = tonumber(redis.call('LLEN', failedList))
if failedLen > failedStart then
    local page = redis.call('LRANGE', failedList, failedStart, failedEnd)
    for _, taskKey in ipairs(page) do
        if redis.call('EXISTS', taskKey) == 0 then
            redis.call('LREM', failedList, 1, taskKey)
        end
    end
    if failedEnd + 1 < failedLen then
        nextFailed = failedEnd + 1
    end
end

return {nextSuccess, nextFailed}
"#;

/// KEYS[1] unique index key. ARGV[1] task id, ARGV[2] TTL seconds.
/// Returns 1 if the uniqueness claim was acquired, 0 if a duplicate already holds it.
pub static CLAIM_UNIQUE: Lazy<Script> = Lazy::new(|| Script::new(CLAIM_UNIQUE_SRC));
const CLAIM_UNIQUE_SRC: &str = r#"
local key = KEYS[1]
local taskId = ARGV[1]
local ttl = tonumber(ARGV[2])
local ok = redis.call('SET', key, taskId, 'NX', 'EX', ttl)
if ok then
    return 1
end
return 0
"#;
