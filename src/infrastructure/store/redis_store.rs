//! Redis store
//!
//! Shops and sources are JSON documents. A redirect log keeps its appended
//! JSON in `data` and every field that changes later as a plain hash field,
//! so scripts update logs without re-encoding them. Compare-and-swap writes,
//! linked shop and log writes, log transitions and the stats aggregation run
//! as Lua scripts, atomic across service instances sharing one Redis.
//!
//! Scripts that walk logs build log keys from a prefix, so this backend
//! expects a single Redis node, not a cluster.
//!
//! | Key | Type | Content |
//! |-----|------|---------|
//! | `rotator:rotation` | hash | `mode`, `current_index` |
//! | `rotator:target_shop:{id}` | hash | `data` (JSON), `revision` |
//! | `rotator:target_shops:by_created` | zset | shop ids scored by creation ms |
//! | `rotator:target_shops:by_domain` | hash | domain -> id |
//! | `rotator:source_shop:{id}` | string | JSON |
//! | `rotator:source_shops:by_created` | zset | source ids scored by creation ms |
//! | `rotator:source_shops:by_domain` | hash | domain -> id |
//! | `rotator:source_shops:by_api_key` | hash | api key -> id |
//! | `rotator:redirect_log:{id}` | hash | `data` (JSON), `target`, `total`, `success`, `inFlight`, `completed`, `checkoutUrl`, `cartToken`, `errorMessage`, `completedAt`, `orderId` |
//! | `rotator:redirect_logs:by_time` | zset | log ids scored by creation ms |
//! | `rotator:redirect_logs:by_target:{id}` | zset | log ids of one target |
//! | `rotator:redirect_logs:by_cart_token` | hash | cart token -> log id |

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use redis::{AsyncCommands, Script, ScriptInvocation, aio::ConnectionManager};
use rust_decimal::Decimal;
use uuid::Uuid;

use super::{
    CasOutcome, LinkedOutcome, LogChange, RedirectLogRepository, RotationStateRepository,
    Settlement, ShopRepository, SourceShopRepository, counts_as_revenue,
};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    LogFilter, NewRedirectLog, RedirectLog, RevenueBasis, RotationMode, RotationState,
    SourceShop, TargetAggregate, TargetShop, TimeWindow,
};

const ROTATION_KEY: &str = "rotator:rotation";
const SHOPS_BY_CREATED: &str = "rotator:target_shops:by_created";
const SHOPS_BY_DOMAIN: &str = "rotator:target_shops:by_domain";
const SOURCES_BY_CREATED: &str = "rotator:source_shops:by_created";
const SOURCES_BY_DOMAIN: &str = "rotator:source_shops:by_domain";
const SOURCES_BY_API_KEY: &str = "rotator:source_shops:by_api_key";
const LOGS_BY_TIME: &str = "rotator:redirect_logs:by_time";
const LOGS_BY_CART_TOKEN: &str = "rotator:redirect_logs:by_cart_token";
const LOG_KEY_PREFIX: &str = "rotator:redirect_log:";

/// Logs fetched per MGET round trip
const LOG_BATCH: usize = 200;

fn shop_key(id: &str) -> String {
    format!("rotator:target_shop:{}", id)
}

fn source_key(id: &str) -> String {
    format!("rotator:source_shop:{}", id)
}

fn log_key(id: &str) -> String {
    format!("{}{}", LOG_KEY_PREFIX, id)
}

fn logs_by_target_key(target_shop_id: &str) -> String {
    format!("rotator:redirect_logs:by_target:{}", target_shop_id)
}

// KEYS: by_domain, shop key, by_created
// ARGV: domain, id, json, revision, created score
static INSERT_SHOP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
if redis.call('HSETNX', KEYS[1], ARGV[1], ARGV[2]) == 0 then return 0 end
redis.call('HSET', KEYS[2], 'data', ARGV[3], 'revision', ARGV[4])
redis.call('ZADD', KEYS[3], ARGV[5], ARGV[2])
return 1
",
    )
});

// KEYS: shop key, by_domain
// ARGV: expected revision, json, new domain, id, new revision
// 1 applied, 0 stale revision, -1 missing, -2 domain owned by another shop
static SWAP_SHOP: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local rev = redis.call('HGET', KEYS[1], 'revision')
if not rev then return -1 end
if rev ~= ARGV[1] then return 0 end
local owner = redis.call('HGET', KEYS[2], ARGV[3])
if owner and owner ~= ARGV[4] then return -2 end
local old = cjson.decode(redis.call('HGET', KEYS[1], 'data'))
if old.domain ~= ARGV[3] then
  redis.call('HDEL', KEYS[2], old.domain)
  redis.call('HSET', KEYS[2], ARGV[3], ARGV[4])
end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'revision', ARGV[5])
return 1
",
    )
});

/// Shared by the log scripts.
///
/// Log change arguments start at ARGV[a]: kind, log id, score, cart token
/// (empty for none), then field/value pairs for the log hash. Log keys start
/// at KEYS[k]: log, by_time, by_cart_token, then by_target for appends only.
const LOG_CHANGE_LUA: &str = r"
local function log_change_applies(log_key, kind)
  if kind == 'append' then
    return redis.call('EXISTS', log_key) == 0
  end
  local f = redis.call('HMGET', log_key, 'completed', 'inFlight')
  if kind == 'settle' then
    return f[1] == '0' and f[2] == '1'
  end
  return f[1] == '0' and f[2] == '0'
end

local function apply_log_change(k, a)
  local kind, id = ARGV[a], ARGV[a + 1]
  redis.call('HSET', KEYS[k], unpack(ARGV, a + 4))
  if kind == 'append' then
    redis.call('ZADD', KEYS[k + 1], ARGV[a + 2], id)
    redis.call('ZADD', KEYS[k + 3], ARGV[a + 2], id)
  end
  if ARGV[a + 3] ~= '' then
    redis.call('HSET', KEYS[k + 2], ARGV[a + 3], id)
  end
end
";

// KEYS: log keys from 1
// ARGV: log change from 1
// 1 applied, 0 log not in the required state
static APPLY_LOG: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        "{}{}",
        LOG_CHANGE_LUA,
        r"
if not log_change_applies(KEYS[1], ARGV[1]) then return 0 end
apply_log_change(1, 1)
return 1
"
    ))
});

// KEYS: shop key, then log keys from 2
// ARGV: expected revision, json, new revision, then log change from 4
// 1 applied, 0 stale revision, -1 missing shop, -3 log not in the required state
static SWAP_SHOP_WITH_LOG: Lazy<Script> = Lazy::new(|| {
    Script::new(&format!(
        "{}{}",
        LOG_CHANGE_LUA,
        r"
local rev = redis.call('HGET', KEYS[1], 'revision')
if not rev then return -1 end
if rev ~= ARGV[1] then return 0 end
if not log_change_applies(KEYS[2], ARGV[4]) then return -3 end
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'revision', ARGV[3])
apply_log_change(2, 4)
return 1
"
    ))
});

// KEYS: by_time
// ARGV: min score, max score, log key prefix
// One row per target: {target, redirections, successes, completions, {completed totals}}
static AGGREGATE_LOGS: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], ARGV[1], ARGV[2])
local rows, order = {}, {}
for _, id in ipairs(ids) do
  local f = redis.call('HMGET', ARGV[3] .. id, 'target', 'success', 'completed', 'total')
  local target = f[1]
  if target then
    local row = rows[target]
    if not row then
      row = {target, 0, 0, 0, {}}
      rows[target] = row
      table.insert(order, target)
    end
    row[2] = row[2] + 1
    if f[2] == '1' then row[3] = row[3] + 1 end
    if f[3] == '1' then
      row[4] = row[4] + 1
      table.insert(row[5], f[4])
    end
  end
end
local out = {}
for _, target in ipairs(order) do table.insert(out, rows[target]) end
return out
",
    )
});

// KEYS: rotation key
// ARGV: expected index, next index
static ADVANCE_INDEX: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
local cur = redis.call('HGET', KEYS[1], 'current_index')
if not cur then cur = '0' end
if cur ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'current_index', ARGV[2])
return 1
",
    )
});

#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn fetch_logs(&self, ids: &[String]) -> StoreResult<Vec<RedirectLog>> {
        let mut logs = Vec::with_capacity(ids.len());
        let mut con = self.conn();
        for chunk in ids.chunks(LOG_BATCH) {
            let mut pipe = redis::pipe();
            for id in chunk {
                pipe.hgetall(log_key(id));
            }
            let raw: Vec<HashMap<String, String>> = pipe.query_async(&mut con).await?;
            for fields in raw {
                if let Some(log) = log_from_fields(fields)? {
                    logs.push(log);
                }
            }
        }
        Ok(logs)
    }

    /// Log key arguments, starting at the invocation's next key slot
    fn push_log_keys(invocation: &mut ScriptInvocation<'_>, change: &LogChange) {
        invocation
            .key(log_key(change.log_id()))
            .key(LOGS_BY_TIME)
            .key(LOGS_BY_CART_TOKEN);
        if let LogChange::Append(log) = change {
            invocation.key(logs_by_target_key(&log.target_shop_id));
        }
    }

    /// Log change arguments, starting at the invocation's next argument slot
    fn push_log_args(invocation: &mut ScriptInvocation<'_>, change: &LogChange) -> StoreResult<()> {
        let (kind, score, cart_token, fields) = encode_change(change)?;
        invocation
            .arg(kind)
            .arg(change.log_id())
            .arg(score)
            .arg(cart_token.unwrap_or_default());
        for (name, value) in fields {
            invocation.arg(name).arg(value);
        }
        Ok(())
    }

    /// Log ids newest first, optionally restricted to one target
    async fn log_ids_newest_first(&self, target_shop_id: Option<&str>) -> StoreResult<Vec<String>> {
        let key = match target_shop_id {
            Some(id) => logs_by_target_key(id),
            None => LOGS_BY_TIME.to_string(),
        };
        let mut con = self.conn();
        let ids: Vec<String> = con.zrevrange(key, 0, -1).await?;
        Ok(ids)
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn flag(value: bool) -> String {
    String::from(if value { "1" } else { "0" })
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

type LogFields = Vec<(&'static str, String)>;

/// Hash fields holding the parts of a log that change after it is appended
fn mutable_fields(log: &RedirectLog) -> LogFields {
    let mut fields = vec![
        ("success", flag(log.success)),
        ("inFlight", flag(log.in_flight)),
        ("completed", flag(log.completed)),
    ];
    let optional = [
        ("checkoutUrl", log.checkout_url.clone()),
        ("cartToken", log.cart_token.clone()),
        ("errorMessage", log.error_message.clone()),
        ("completedAt", log.completed_at.map(timestamp)),
        ("orderId", log.order_id.clone()),
    ];
    fields.extend(
        optional
            .into_iter()
            .filter_map(|(name, value)| value.map(|v| (name, v))),
    );
    fields
}

/// Script arguments for `change`: kind, score, cart token to index, hash fields
fn encode_change(change: &LogChange) -> StoreResult<(&'static str, i64, Option<String>, LogFields)> {
    match change {
        LogChange::Append(log) => {
            let mut fields = vec![
                ("data", serde_json::to_string(log)?),
                ("target", log.target_shop_id.clone()),
                ("total", log.cart_total.to_string()),
            ];
            fields.extend(mutable_fields(log));
            Ok(("append", millis(log.created_at), log.cart_token.clone(), fields))
        }
        LogChange::Settle { settlement, .. } => {
            let mut fields = vec![("inFlight", flag(false))];
            let cart_token = match settlement {
                Settlement::Checkout {
                    checkout_url,
                    cart_token,
                } => {
                    fields.push(("checkoutUrl", checkout_url.clone()));
                    fields.push(("cartToken", cart_token.clone()));
                    Some(cart_token.clone())
                }
                Settlement::Failed {
                    fallback_url,
                    error_message,
                } => {
                    fields.push(("success", flag(false)));
                    fields.push(("checkoutUrl", fallback_url.clone()));
                    fields.push(("errorMessage", error_message.clone()));
                    None
                }
            };
            Ok(("settle", 0, cart_token, fields))
        }
        LogChange::Complete {
            order_id,
            completed_at,
            ..
        } => Ok((
            "complete",
            0,
            None,
            vec![
                ("completed", flag(true)),
                ("completedAt", timestamp(*completed_at)),
                ("orderId", order_id.clone()),
            ],
        )),
    }
}

/// Appended JSON with the later field updates laid over it. `None` for a
/// missing log.
fn log_from_fields(mut fields: HashMap<String, String>) -> StoreResult<Option<RedirectLog>> {
    let Some(data) = fields.remove("data") else {
        return Ok(None);
    };
    let mut log: RedirectLog = serde_json::from_str(&data)?;
    if let Some(v) = fields.remove("success") {
        log.success = v == "1";
    }
    if let Some(v) = fields.remove("inFlight") {
        log.in_flight = v == "1";
    }
    if let Some(v) = fields.remove("completed") {
        log.completed = v == "1";
    }
    if let Some(v) = fields.remove("checkoutUrl") {
        log.checkout_url = Some(v);
    }
    if let Some(v) = fields.remove("cartToken") {
        log.cart_token = Some(v);
    }
    if let Some(v) = fields.remove("errorMessage") {
        log.error_message = Some(v);
    }
    if let Some(v) = fields.remove("orderId") {
        log.order_id = Some(v);
    }
    if let Some(v) = fields.remove("completedAt") {
        let at = DateTime::parse_from_rfc3339(&v)
            .map_err(|_| StoreError::Serialization(format!("bad completedAt '{}'", v)))?;
        log.completed_at = Some(at.with_timezone(&Utc));
    }
    Ok(Some(log))
}

#[async_trait]
impl ShopRepository for RedisStore {
    async fn insert(&self, shop: TargetShop) -> StoreResult<TargetShop> {
        let json = serde_json::to_string(&shop)?;
        let mut con = self.conn();
        let inserted: i64 = INSERT_SHOP
            .key(SHOPS_BY_DOMAIN)
            .key(shop_key(&shop.id))
            .key(SHOPS_BY_CREATED)
            .arg(&shop.domain)
            .arg(&shop.id)
            .arg(json)
            .arg(shop.revision)
            .arg(millis(shop.created_at))
            .invoke_async(&mut con)
            .await?;
        if inserted == 0 {
            return Err(StoreError::Duplicate(format!("target shop {}", shop.domain)));
        }
        Ok(shop)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<TargetShop>> {
        let mut con = self.conn();
        let raw: Option<String> = con.hget(shop_key(id), "data").await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn list(&self) -> StoreResult<Vec<TargetShop>> {
        let mut con = self.conn();
        let ids: Vec<String> = con.zrange(SHOPS_BY_CREATED, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hget(shop_key(id), "data");
        }
        let raw: Vec<Option<String>> = pipe.query_async(&mut con).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: TargetShop,
    ) -> StoreResult<CasOutcome<TargetShop>> {
        let json = serde_json::to_string(&next)?;
        let mut con = self.conn();
        let outcome: i64 = SWAP_SHOP
            .key(shop_key(&next.id))
            .key(SHOPS_BY_DOMAIN)
            .arg(expected_revision)
            .arg(json)
            .arg(&next.domain)
            .arg(&next.id)
            .arg(next.revision)
            .invoke_async(&mut con)
            .await?;
        match outcome {
            1 => Ok(CasOutcome::Applied(next)),
            0 => Ok(CasOutcome::Conflict),
            -1 => Err(StoreError::NotFound(format!("target shop {}", next.id))),
            _ => Err(StoreError::Duplicate(format!("target shop {}", next.domain))),
        }
    }

    async fn compare_and_swap_with_log(
        &self,
        expected_revision: u64,
        next: TargetShop,
        change: LogChange,
    ) -> StoreResult<LinkedOutcome> {
        let json = serde_json::to_string(&next)?;
        let mut invocation = SWAP_SHOP_WITH_LOG.prepare_invoke();
        invocation.key(shop_key(&next.id));
        Self::push_log_keys(&mut invocation, &change);
        invocation.arg(expected_revision).arg(json).arg(next.revision);
        Self::push_log_args(&mut invocation, &change)?;

        let mut con = self.conn();
        let outcome: i64 = invocation.invoke_async(&mut con).await?;
        match outcome {
            1 => {
                let log = RedirectLogRepository::get(self, change.log_id())
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("redirect log {}", change.log_id())))?;
                Ok(LinkedOutcome::Applied { shop: next, log })
            }
            0 => Ok(LinkedOutcome::Conflict),
            -1 => Err(StoreError::NotFound(format!("target shop {}", next.id))),
            _ => Ok(LinkedOutcome::LogRejected),
        }
    }

    async fn delete(&self, id: &str) -> StoreResult<bool> {
        let Some(shop) = ShopRepository::get(self, id).await? else {
            return Ok(false);
        };
        let mut con = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .del(shop_key(id))
            .ignore()
            .zrem(SHOPS_BY_CREATED, id)
            .ignore()
            .hdel(SHOPS_BY_DOMAIN, &shop.domain)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl SourceShopRepository for RedisStore {
    async fn insert(&self, shop: SourceShop) -> StoreResult<SourceShop> {
        let mut con = self.conn();
        let claimed: bool = con.hset_nx(SOURCES_BY_DOMAIN, &shop.domain, &shop.id).await?;
        if !claimed {
            return Err(StoreError::Duplicate(format!("source shop {}", shop.domain)));
        }
        let json = serde_json::to_string(&shop)?;
        let _: () = redis::pipe()
            .atomic()
            .set(source_key(&shop.id), json)
            .ignore()
            .zadd(SOURCES_BY_CREATED, &shop.id, millis(shop.created_at))
            .ignore()
            .hset(SOURCES_BY_API_KEY, &shop.api_key, &shop.id)
            .ignore()
            .query_async(&mut con)
            .await?;
        Ok(shop)
    }

    async fn get(&self, id: &str) -> StoreResult<Option<SourceShop>> {
        let mut con = self.conn();
        let raw: Option<String> = con.get(source_key(id)).await?;
        raw.map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .transpose()
    }

    async fn find_by_api_key(&self, api_key: &str) -> StoreResult<Option<SourceShop>> {
        let mut con = self.conn();
        let id: Option<String> = con.hget(SOURCES_BY_API_KEY, api_key).await?;
        match id {
            Some(id) => SourceShopRepository::get(self, &id).await,
            None => Ok(None),
        }
    }

    async fn list(&self) -> StoreResult<Vec<SourceShop>> {
        let mut con = self.conn();
        let ids: Vec<String> = con.zrange(SOURCES_BY_CREATED, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let keys: Vec<String> = ids.iter().map(|id| source_key(id)).collect();
        let raw: Vec<Option<String>> = redis::cmd("MGET").arg(&keys).query_async(&mut con).await?;
        raw.into_iter()
            .flatten()
            .map(|json| serde_json::from_str(&json).map_err(StoreError::from))
            .collect()
    }

    async fn update(&self, shop: SourceShop) -> StoreResult<SourceShop> {
        let json = serde_json::to_string(&shop)?;
        let mut con = self.conn();
        // SET XX: only overwrite an existing record
        let written: Option<String> = redis::cmd("SET")
            .arg(source_key(&shop.id))
            .arg(json)
            .arg("XX")
            .query_async(&mut con)
            .await?;
        if written.is_none() {
            return Err(StoreError::NotFound(format!("source shop {}", shop.id)));
        }
        Ok(shop)
    }
}

#[async_trait]
impl RedirectLogRepository for RedisStore {
    async fn append(&self, log: NewRedirectLog) -> StoreResult<RedirectLog> {
        let log = RedirectLog::from_new(Uuid::new_v4().to_string(), log, Utc::now());
        self.apply(LogChange::Append(log))
            .await?
            .ok_or_else(|| StoreError::Duplicate("redirect log id".into()))
    }

    async fn get(&self, id: &str) -> StoreResult<Option<RedirectLog>> {
        let mut con = self.conn();
        let fields: HashMap<String, String> = con.hgetall(log_key(id)).await?;
        log_from_fields(fields)
    }

    async fn list(&self, filter: &LogFilter) -> StoreResult<Vec<RedirectLog>> {
        let ids = self
            .log_ids_newest_first(filter.target_shop_id.as_deref())
            .await?;
        let mut out = Vec::new();
        for chunk in ids.chunks(LOG_BATCH) {
            for log in self.fetch_logs(chunk).await? {
                if filter.matches(&log) {
                    out.push(log);
                    if out.len() >= filter.limit {
                        return Ok(out);
                    }
                }
            }
        }
        Ok(out)
    }

    async fn find_pending_by_cart_token(&self, cart_token: &str) -> StoreResult<Option<RedirectLog>> {
        let mut con = self.conn();
        let id: Option<String> = con.hget(LOGS_BY_CART_TOKEN, cart_token).await?;
        let Some(id) = id else {
            return Ok(None);
        };
        Ok(RedirectLogRepository::get(self, &id)
            .await?
            .filter(RedirectLog::is_pending))
    }

    async fn latest_pending(&self) -> StoreResult<Option<RedirectLog>> {
        let ids = self.log_ids_newest_first(None).await?;
        for chunk in ids.chunks(LOG_BATCH) {
            if let Some(log) = self
                .fetch_logs(chunk)
                .await?
                .into_iter()
                .find(RedirectLog::is_pending)
            {
                return Ok(Some(log));
            }
        }
        Ok(None)
    }

    async fn apply(&self, change: LogChange) -> StoreResult<Option<RedirectLog>> {
        let mut invocation = APPLY_LOG.prepare_invoke();
        Self::push_log_keys(&mut invocation, &change);
        Self::push_log_args(&mut invocation, &change)?;

        let mut con = self.conn();
        let applied: i64 = invocation.invoke_async(&mut con).await?;
        if applied == 0 {
            return Ok(None);
        }
        RedirectLogRepository::get(self, change.log_id()).await
    }

    async fn sum_revenue(
        &self,
        target_shop_id: &str,
        basis: RevenueBasis,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Decimal> {
        let key = logs_by_target_key(target_shop_id);
        let mut con = self.conn();
        // Completion time is not indexed, so the completed basis scans the whole target
        let ids: Vec<String> = match (basis, since) {
            (RevenueBasis::Redirected, Some(since)) => {
                con.zrangebyscore(key, millis(since), "+inf").await?
            }
            _ => con.zrange(key, 0, -1).await?,
        };
        Ok(self
            .fetch_logs(&ids)
            .await?
            .iter()
            .filter(|l| counts_as_revenue(l, basis, since))
            .map(|l| l.cart_total)
            .sum())
    }

    async fn aggregate_by_target(&self, window: TimeWindow) -> StoreResult<Vec<TargetAggregate>> {
        let min = window
            .start
            .map(|t| millis(t).to_string())
            .unwrap_or_else(|| "-inf".to_string());
        let max = window
            .end
            .map(|t| millis(t).to_string())
            .unwrap_or_else(|| "+inf".to_string());
        let mut con = self.conn();
        let rows: Vec<(String, u64, u64, u64, Vec<String>)> = AGGREGATE_LOGS
            .key(LOGS_BY_TIME)
            .arg(min)
            .arg(max)
            .arg(LOG_KEY_PREFIX)
            .invoke_async(&mut con)
            .await?;

        // Amounts are summed here; Lua numbers are doubles
        let mut aggregates = rows
            .into_iter()
            .map(|(target_shop_id, total, successful, completed, totals)| {
                let total_revenue = totals.iter().try_fold(Decimal::ZERO, |sum, raw| {
                    raw.parse::<Decimal>()
                        .map(|amount| sum.saturating_add(amount))
                        .map_err(|_| StoreError::Serialization(format!("bad cart total '{}'", raw)))
                })?;
                Ok(TargetAggregate {
                    target_shop_id,
                    total_redirections: total,
                    successful_redirections: successful,
                    completed_checkouts: completed,
                    total_revenue,
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        aggregates.sort_by(|a, b| a.target_shop_id.cmp(&b.target_shop_id));
        Ok(aggregates)
    }
}

fn parse_rotation(fields: HashMap<String, String>) -> StoreResult<RotationState> {
    let mode = match fields.get("mode") {
        Some(raw) => raw.parse().map_err(StoreError::Serialization)?,
        None => RotationMode::default(),
    };
    let current_index = match fields.get("current_index") {
        Some(raw) => raw
            .parse()
            .map_err(|_| StoreError::Serialization(format!("bad current_index '{}'", raw)))?,
        None => 0,
    };
    Ok(RotationState {
        mode,
        current_index,
    })
}

#[async_trait]
impl RotationStateRepository for RedisStore {
    async fn load_or_init(&self) -> StoreResult<RotationState> {
        let mut con = self.conn();
        let (fields,): (HashMap<String, String>,) = redis::pipe()
            .atomic()
            .hset_nx(ROTATION_KEY, "mode", RotationMode::default().as_str())
            .ignore()
            .hset_nx(ROTATION_KEY, "current_index", 0)
            .ignore()
            .hgetall(ROTATION_KEY)
            .query_async(&mut con)
            .await?;
        parse_rotation(fields)
    }

    async fn set_mode(&self, mode: RotationMode) -> StoreResult<RotationState> {
        let mut con = self.conn();
        let _: () = con.hset(ROTATION_KEY, "mode", mode.as_str()).await?;
        self.load_or_init().await
    }

    async fn compare_and_set_index(&self, expected: u64, next: u64) -> StoreResult<bool> {
        let mut con = self.conn();
        let applied: i64 = ADVANCE_INDEX
            .key(ROTATION_KEY)
            .arg(expected)
            .arg(next)
            .invoke_async(&mut con)
            .await?;
        Ok(applied == 1)
    }

    async fn reset_index(&self) -> StoreResult<()> {
        let mut con = self.conn();
        let _: () = con.hset(ROTATION_KEY, "current_index", 0).await?;
        Ok(())
    }
}
