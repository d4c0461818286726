//! Redis Lua 脚本
//! Redis Lua scripts
//!
//! 任务状态与索引必须一起变化，所以所有多键更新都放在脚本中执行

use crate::error::{Error, Result};
use phf::phf_map;
use redis::aio::MultiplexedConnection;
use redis::{ErrorKind, RedisWrite, ToRedisArgs};
use std::collections::HashMap;

#[derive(Clone, Debug)]
pub enum RedisArg {
  Int(i64),
  Str(String),
  Float(f64),
  Bool(bool),
}

impl ToRedisArgs for RedisArg {
  fn write_redis_args<W>(&self, out: &mut W)
  where
    W: ?Sized + RedisWrite,
  {
    match self {
      RedisArg::Int(i) => i.write_redis_args(out),
      RedisArg::Str(s) => s.write_redis_args(out),
      RedisArg::Float(f) => f.write_redis_args(out),
      RedisArg::Bool(b) => (*b as i64).write_redis_args(out),
    }
  }
}

pub mod scripts {
  /// 写入任务并维护索引
  /// Write a job and maintain its indexes
  /// `KEYS[1]` -> `<prefix>:job:<id>`
  /// `ARGV[1]` -> 任务 id / job id
  /// `ARGV[2]` -> 任务 JSON / job JSON
  /// `ARGV[3]` -> 状态码 / status code
  /// `ARGV[4]` -> 可认领集合中的分数 / score in the claimable set
  /// `ARGV[5]` -> 序列，无则为空 / sequence, empty when none
  /// `ARGV[6]` -> worker
  /// `ARGV[7]` -> locked_by，无则为空 / locked_by, empty when none
  /// `ARGV[8]` -> run_at（毫秒）/ run_at in milliseconds
  /// `ARGV[9]` -> 是否可认领 / claimable flag
  /// `ARGV[10]` -> 是否未结束 / outstanding flag
  /// `ARGV[11]` -> 是否 BUSY / busy flag
  /// `ARGV[12]` -> 键前缀 / key prefix
  pub const PERSIST: &str = r#"
        local prefix = ARGV[12]
        local id = ARGV[1]
        local old = redis.call("HMGET", KEYS[1], "status", "sequence", "worker", "locked_by")
        if old[1] then
            redis.call("SREM", prefix .. ":status:" .. old[1], id)
            redis.call("ZREM", prefix .. ":open", id)
            if old[2] and old[2] ~= "" then
                redis.call("ZREM", prefix .. ":seq:" .. old[2], id)
            end
            if old[3] then
                redis.call("SREM", prefix .. ":worker:" .. old[3], id)
            end
            if old[4] and old[4] ~= "" then
                redis.call("SREM", prefix .. ":busy:" .. old[4], id)
            end
        end
        redis.call("HSET", KEYS[1],
                   "json", ARGV[2],
                   "status", ARGV[3],
                   "sequence", ARGV[5],
                   "worker", ARGV[6],
                   "locked_by", ARGV[7],
                   "run_at", ARGV[8])
        redis.call("SADD", prefix .. ":status:" .. ARGV[3], id)
        if ARGV[9] == "1" then
            redis.call("ZADD", prefix .. ":open", ARGV[4], id)
            redis.call("SADD", prefix .. ":worker:" .. ARGV[6], id)
        end
        if ARGV[10] == "1" and ARGV[5] ~= "" then
            redis.call("ZADD", prefix .. ":seq:" .. ARGV[5], id, id)
        end
        if ARGV[11] == "1" and ARGV[7] ~= "" then
            redis.call("SADD", prefix .. ":busy:" .. ARGV[7], id)
        end
        return 1
    "#;

  /// 条件认领：只有当前状态可认领时才改为 BUSY
  /// Conditional claim: moves to BUSY only from a claimable status
  /// `KEYS[1]` -> `<prefix>:job:<id>`
  /// `ARGV[1]` -> 任务 id / job id
  /// `ARGV[2]` -> locked_by
  /// `ARGV[3]` -> 键前缀 / key prefix
  /// `ARGV[4]` -> BUSY 状态码 / BUSY status code
  /// `ARGV[5..]` -> 可认领的状态码 / claimable status codes
  /// 返回值：1=成功，0=不可认领，-1=不存在
  /// Returns: 1 claimed, 0 not claimable, -1 missing
  pub const CLAIM: &str = r#"
        local fields = redis.call("HMGET", KEYS[1], "status", "worker", "locked_by")
        local status = fields[1]
        if not status then
            return -1
        end
        local claimable = false
        for i = 5, #ARGV do
            if ARGV[i] == status then
                claimable = true
            end
        end
        if not claimable then
            return 0
        end
        local prefix = ARGV[3]
        local id = ARGV[1]
        redis.call("SREM", prefix .. ":status:" .. status, id)
        redis.call("SADD", prefix .. ":status:" .. ARGV[4], id)
        redis.call("ZREM", prefix .. ":open", id)
        if fields[2] then
            redis.call("SREM", prefix .. ":worker:" .. fields[2], id)
        end
        if fields[3] and fields[3] ~= "" then
            redis.call("SREM", prefix .. ":busy:" .. fields[3], id)
        end
        redis.call("HSET", KEYS[1], "status", ARGV[4], "locked_by", ARGV[2])
        redis.call("SADD", prefix .. ":busy:" .. ARGV[2], id)
        return 1
    "#;

  /// 查找下一个可认领的任务
  /// Find the next claimable job
  /// `KEYS[1]` -> `<prefix>:open`
  /// `ARGV[1]` -> 键前缀 / key prefix
  /// `ARGV[2]` -> 当前时间（毫秒）/ now in milliseconds
  /// `ARGV[3]` -> 排除的任务 id（JSON 字符串数组）/ excluded job ids, JSON array of strings
  /// `ARGV[4]` -> 排除的序列（JSON 字符串数组）/ excluded sequences, JSON array of strings
  /// `ARGV[5]` -> 本页起始下标 / offset of this page
  /// `ARGV[6]` -> 页大小 / page size
  /// 返回 `{id, scanned}`，本页没有可认领任务时 id 为空串
  /// Returns `{id, scanned}`, id is empty when this page holds nothing claimable
  pub const NEXT_OPEN: &str = r#"
        local excluded_ids = {}
        for _, v in ipairs(cjson.decode(ARGV[3])) do
            excluded_ids[v] = true
        end
        local excluded_sequences = {}
        for _, v in ipairs(cjson.decode(ARGV[4])) do
            excluded_sequences[v] = true
        end
        local now = tonumber(ARGV[2])
        local offset = tonumber(ARGV[5])
        local ids = redis.call("ZRANGE", KEYS[1], offset, offset + tonumber(ARGV[6]) - 1)
        for _, id in ipairs(ids) do
            if not excluded_ids[id] then
                local fields = redis.call("HMGET", ARGV[1] .. ":job:" .. id, "run_at", "sequence")
                if fields[1] and tonumber(fields[1]) <= now then
                    local sequence = fields[2]
                    if not sequence or sequence == "" then
                        return {id, #ids}
                    end
                    if not excluded_sequences[sequence] then
                        local head = redis.call("ZRANGE", ARGV[1] .. ":seq:" .. sequence, 0, 0)
                        if head[1] == id then
                            return {id, #ids}
                        end
                    end
                end
            end
        end
        return {"", #ids}
    "#;

  /// 把到期的延迟消息移入就绪队列
  /// Move due delayed messages into the ready queue
  /// `KEYS[1]` -> `<prefix>:broker:scheduled`
  /// `KEYS[2]` -> `<prefix>:broker:queue`
  /// `ARGV[1]` -> 当前时间（毫秒）/ now in milliseconds
  /// `ARGV[2]` -> 单次最多移动的数量 / max messages moved per call
  pub const FORWARD: &str = r#"
        local due = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", ARGV[1], "LIMIT", 0, ARGV[2])
        for _, message in ipairs(due) do
            redis.call("LPUSH", KEYS[2], message)
            redis.call("ZREM", KEYS[1], message)
        end
        return #due
    "#;

  /// 把处理中列表的消息放回就绪队列
  /// Return messages left in a processing list to the ready queue
  /// `KEYS[1]` -> `<prefix>:broker:processing:<tag>`
  /// `KEYS[2]` -> `<prefix>:broker:queue`
  pub const RECOVER: &str = r#"
        local moved = 0
        while redis.call("LMOVE", KEYS[1], KEYS[2], "LEFT", "RIGHT") do
            moved = moved + 1
        end
        return moved
    "#;
}

/// Redis 脚本管理器
/// Redis script manager
#[derive(Debug, Default, Clone)]
pub struct ScriptManager {
  /// 脚本SHA缓存
  script_sha1: HashMap<&'static str, String>,
}

impl ScriptManager {
  /// 预加载所有脚本
  /// Preload every script
  pub async fn load_scripts(&mut self, conn: &mut MultiplexedConnection) -> Result<()> {
    for (name, script) in ALL_SCRIPT.entries() {
      let sha = Self::load_script(conn, script).await?;
      self.script_sha1.insert(*name, sha);
    }
    Ok(())
  }

  async fn load_script(conn: &mut MultiplexedConnection, script: &str) -> Result<String> {
    let sha: String = redis::cmd("SCRIPT")
      .arg("LOAD")
      .arg(script)
      .query_async(conn)
      .await?;
    Ok(sha)
  }

  pub fn get_script_sha(&self, name: &str) -> Option<&String> {
    self.script_sha1.get(name)
  }

  /// 执行脚本，脚本缓存被清空时退回 EVAL
  /// Run a script, falling back to EVAL when the script cache was flushed
  pub async fn eval_script<T>(
    &self,
    conn: &mut MultiplexedConnection,
    script_name: &str,
    keys: &[String],
    args: &[RedisArg],
  ) -> Result<T>
  where
    T: redis::FromRedisValue,
  {
    let script = ALL_SCRIPT
      .get(script_name)
      .ok_or_else(|| Error::other(format!("Script not found: {script_name}")))?;

    if let Some(sha) = self.get_script_sha(script_name) {
      match redis::cmd("EVALSHA")
        .arg(sha)
        .arg(keys.len())
        .arg(keys)
        .arg(args)
        .query_async::<T>(conn)
        .await
      {
        Ok(result) => return Ok(result),
        Err(e) if e.kind() == ErrorKind::NoScriptError => {
          tracing::debug!(script = script_name, "script cache flushed, falling back to EVAL");
        }
        Err(e) => return Err(e.into()),
      }
    }

    let result = redis::cmd("EVAL")
      .arg(*script)
      .arg(keys.len())
      .arg(keys)
      .arg(args)
      .query_async::<T>(conn)
      .await?;
    Ok(result)
  }
}

static ALL_SCRIPT: phf::Map<&'static str, &'static str> = phf_map! {
    "persist" => scripts::PERSIST,
    "claim" => scripts::CLAIM,
    "next_open" => scripts::NEXT_OPEN,
    "forward" => scripts::FORWARD,
    "recover" => scripts::RECOVER,
};
