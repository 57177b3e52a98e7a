//! An in-memory stand-in for a Redis server, speaking the packed protocol the client sends.
//!
//! Only the commands the cache issues are understood. Scripts are not, so everything built on
//! `EVALSHA` is covered by the tests running against a real server.

use std::{
    collections::{BTreeMap, HashMap},
    future::{ready, Future},
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use redis::{aio::ConnectionLike, Cmd, ErrorKind, Pipeline, RedisError, RedisResult, Value};

type Reply<'a, T> = Pin<Box<dyn Future<Output = RedisResult<T>> + Send + 'a>>;

/// How `UNLINK` misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkFailure {
    /// The server predates `UNLINK`.
    Unknown,
    /// The server refuses the command.
    Rejected,
}

#[derive(Debug, Clone)]
enum Data {
    Str(Vec<u8>),
    Hash(BTreeMap<String, Vec<u8>>),
    ZSet(BTreeMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    data: Data,
    expires: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    keys: HashMap<String, Entry>,
    log: Vec<Vec<String>>,
    snapshots: HashMap<u64, Vec<String>>,
    next_snapshot: u64,
    transaction: Option<Vec<Value>>,
    broken_scan: bool,
    unlink: Option<UnlinkFailure>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeRedis {
    state: Arc<Mutex<State>>,
}

impl FakeRedis {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.state().keys.insert(
            key.to_owned(),
            Entry {
                data: Data::Str(value.as_bytes().to_vec()),
                expires: None,
            },
        );
    }

    pub fn hset(&self, key: &str, field: &str, value: &str) {
        let mut state = self.state();
        let entry = state.keys.entry(key.to_owned()).or_insert_with(|| Entry {
            data: Data::Hash(BTreeMap::new()),
            expires: None,
        });
        if let Data::Hash(hash) = &mut entry.data {
            hash.insert(field.to_owned(), value.as_bytes().to_vec());
        }
    }

    pub fn zadd(&self, key: &str, member: &str, score: f64) {
        let mut state = self.state();
        let entry = state.keys.entry(key.to_owned()).or_insert_with(|| Entry {
            data: Data::ZSet(BTreeMap::new()),
            expires: None,
        });
        if let Data::ZSet(zset) = &mut entry.data {
            zset.insert(member.to_owned(), score);
        }
    }

    pub fn string(&self, key: &str) -> Option<Vec<u8>> {
        match self.state().live(key).map(|e| &e.data) {
            Some(Data::Str(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().live(key).is_some()
    }

    pub fn remove(&self, key: &str) {
        self.state().keys.remove(key);
    }

    pub fn hash_fields(&self, key: &str) -> Vec<String> {
        match self.state().live(key).map(|e| &e.data) {
            Some(Data::Hash(hash)) => hash.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn zset_members(&self, key: &str) -> Vec<String> {
        match self.state().live(key).map(|e| &e.data) {
            Some(Data::ZSet(zset)) => zset.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn zscore(&self, key: &str, member: &str) -> Option<f64> {
        match self.state().live(key).map(|e| &e.data) {
            Some(Data::ZSet(zset)) => zset.get(member).copied(),
            _ => None,
        }
    }

    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.state();
        let expires = state.live(key)?.expires?;
        Some(expires.saturating_duration_since(Instant::now()))
    }

    pub fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let state = self.state();
        let mut keys: Vec<String> = state
            .keys
            .keys()
            .filter(|k| state.live(k).is_some() && glob(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state().log.clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.state()
            .log
            .iter()
            .filter(|c| c[0].eq_ignore_ascii_case(name))
            .cloned()
            .collect()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    pub fn break_scan(&self) {
        self.state().broken_scan = true;
    }

    pub fn fail_unlink(&self, failure: UnlinkFailure) {
        self.state().unlink = Some(failure);
    }

    fn run(&self, packed: &[u8]) -> RedisResult<Vec<Value>> {
        let mut state = self.state();
        let mut replies = Vec::new();
        for args in parse(packed)? {
            state.log.push(args.iter().map(|a| text(a)).collect());
            match state.dispatch(&args) {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    state.transaction = None;
                    return Err(err);
                }
            }
        }
        Ok(replies)
    }
}

impl ConnectionLike for FakeRedis {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> Reply<'a, Value> {
        let result = self.run(&cmd.get_packed_command()).and_then(|mut replies| {
            replies
                .pop()
                .ok_or_else(|| RedisError::from((ErrorKind::ClientError, "no reply")))
        });
        Box::pin(ready(result))
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> Reply<'a, Vec<Value>> {
        let result = self
            .run(&cmd.get_packed_pipeline())
            .map(|replies| replies.into_iter().skip(offset).take(count).collect());
        Box::pin(ready(result))
    }

    fn get_db(&self) -> i64 {
        0
    }
}

impl State {
    fn live(&self, key: &str) -> Option<&Entry> {
        self.keys
            .get(key)
            .filter(|e| e.expires.map_or(true, |at| at > Instant::now()))
    }

    fn purge(&mut self, key: &str) {
        if self.keys.contains_key(key) && self.live(key).is_none() {
            self.keys.remove(key);
        }
    }

    fn hash_mut(&mut self, key: &str) -> RedisResult<&mut BTreeMap<String, Vec<u8>>> {
        self.purge(key);
        let entry = self.keys.entry(key.to_owned()).or_insert_with(|| Entry {
            data: Data::Hash(BTreeMap::new()),
            expires: None,
        });
        match &mut entry.data {
            Data::Hash(hash) => Ok(hash),
            _ => Err(wrong_type()),
        }
    }

    fn zset_mut(&mut self, key: &str) -> RedisResult<&mut BTreeMap<String, f64>> {
        self.purge(key);
        let entry = self.keys.entry(key.to_owned()).or_insert_with(|| Entry {
            data: Data::ZSet(BTreeMap::new()),
            expires: None,
        });
        match &mut entry.data {
            Data::ZSet(zset) => Ok(zset),
            _ => Err(wrong_type()),
        }
    }

    fn hash(&self, key: &str) -> RedisResult<Option<&BTreeMap<String, Vec<u8>>>> {
        match self.live(key).map(|e| &e.data) {
            None => Ok(None),
            Some(Data::Hash(hash)) => Ok(Some(hash)),
            Some(_) => Err(wrong_type()),
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        let empty = match self.keys.get(key).map(|e| &e.data) {
            Some(Data::Hash(hash)) => hash.is_empty(),
            Some(Data::ZSet(zset)) => zset.is_empty(),
            _ => false,
        };
        if empty {
            self.keys.remove(key);
        }
    }

    fn dispatch(&mut self, args: &[Vec<u8>]) -> RedisResult<Value> {
        let name = text(&args[0]).to_ascii_uppercase();
        let raw = &args[1..];
        let args: Vec<String> = raw.iter().map(|a| text(a)).collect();

        match name.as_str() {
            "MULTI" => {
                self.transaction = Some(Vec::new());
                return Ok(Value::Okay);
            }
            "EXEC" => {
                let results = self.transaction.take().unwrap_or_default();
                return Ok(Value::Bulk(results));
            }
            _ => {}
        }

        let reply = self.execute(&name, &args, raw)?;
        match &mut self.transaction {
            Some(queued) => {
                queued.push(reply);
                Ok(Value::Status("QUEUED".to_owned()))
            }
            None => Ok(reply),
        }
    }

    fn execute(&mut self, name: &str, args: &[String], raw: &[Vec<u8>]) -> RedisResult<Value> {
        match name {
            "GET" => {
                let key = arg(args, 0)?;
                match self.live(key).map(|e| &e.data) {
                    None => Ok(Value::Nil),
                    Some(Data::Str(value)) => Ok(Value::Data(value.clone())),
                    Some(_) => Err(wrong_type()),
                }
            }
            "MGET" => Ok(Value::Bulk(
                args.iter()
                    .map(|key| match self.live(key).map(|e| &e.data) {
                        Some(Data::Str(value)) => Value::Data(value.clone()),
                        _ => Value::Nil,
                    })
                    .collect(),
            )),
            "SET" => {
                let key = arg(args, 0)?;
                let value = raw.get(1).ok_or_else(syntax)?;
                let mut expires = None;
                let mut nx = false;
                let mut i = 2;
                while i < args.len() {
                    match args[i].to_ascii_uppercase().as_str() {
                        "EX" => {
                            let secs = number(arg(args, i + 1)?)?;
                            expires = Some(Instant::now() + Duration::from_secs(secs as u64));
                            i += 1;
                        }
                        "NX" => nx = true,
                        _ => return Err(syntax()),
                    }
                    i += 1;
                }
                if nx && self.live(key).is_some() {
                    return Ok(Value::Nil);
                }
                self.keys.insert(
                    key.clone(),
                    Entry {
                        data: Data::Str(value.clone()),
                        expires,
                    },
                );
                Ok(Value::Okay)
            }
            "DEL" | "UNLINK" => {
                if name == "UNLINK" {
                    match self.unlink {
                        Some(UnlinkFailure::Unknown) => {
                            return Err(RedisError::from((
                                ErrorKind::ResponseError,
                                "unknown command",
                                "'UNLINK'".to_owned(),
                            )))
                        }
                        Some(UnlinkFailure::Rejected) => {
                            return Err(RedisError::from((
                                ErrorKind::ResponseError,
                                "command rejected",
                                "UNLINK is disabled".to_owned(),
                            )))
                        }
                        None => {}
                    }
                }
                let mut removed = 0;
                for key in args {
                    if self.live(key).is_some() {
                        removed += 1;
                    }
                    self.keys.remove(key);
                }
                Ok(Value::Int(removed))
            }
            "EXISTS" => Ok(Value::Int(
                args.iter().filter(|k| self.live(k).is_some()).count() as i64,
            )),
            "EXPIRE" => {
                let key = arg(args, 0)?;
                let secs = number(arg(args, 1)?)?;
                self.purge(key);
                match self.keys.get_mut(key) {
                    Some(entry) => {
                        entry.expires = Some(Instant::now() + Duration::from_secs(secs as u64));
                        Ok(Value::Int(1))
                    }
                    None => Ok(Value::Int(0)),
                }
            }
            "TTL" => {
                let key = arg(args, 0)?;
                Ok(Value::Int(match self.live(key) {
                    None => -2,
                    Some(Entry { expires: None, .. }) => -1,
                    Some(Entry {
                        expires: Some(at), ..
                    }) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
                }))
            }
            "HSET" => {
                let key = arg(args, 0)?;
                if args.len() < 3 || args.len() % 2 == 0 {
                    return Err(syntax());
                }
                let hash = self.hash_mut(key)?;
                let mut added = 0;
                for (field, value) in args[1..].chunks(2).zip(raw[1..].chunks(2)) {
                    if hash.insert(field[0].clone(), value[1].clone()).is_none() {
                        added += 1;
                    }
                }
                Ok(Value::Int(added))
            }
            "HDEL" => {
                let key = arg(args, 0)?;
                if self.hash(key)?.is_none() {
                    return Ok(Value::Int(0));
                }
                let hash = self.hash_mut(key)?;
                let removed = args[1..].iter().filter(|f| hash.remove(*f).is_some()).count();
                self.drop_if_empty(key);
                Ok(Value::Int(removed as i64))
            }
            "HKEYS" => {
                let key = arg(args, 0)?;
                let fields = self
                    .hash(key)?
                    .map(|h| h.keys().map(|f| Value::Data(f.as_bytes().to_vec())).collect())
                    .unwrap_or_default();
                Ok(Value::Bulk(fields))
            }
            "HEXISTS" => {
                let key = arg(args, 0)?;
                let field = arg(args, 1)?;
                let present = self.hash(key)?.map_or(false, |h| h.contains_key(field));
                Ok(Value::Int(i64::from(present)))
            }
            "HLEN" => {
                let key = arg(args, 0)?;
                Ok(Value::Int(self.hash(key)?.map_or(0, |h| h.len() as i64)))
            }
            "HSCAN" => {
                let key = arg(args, 0)?;
                let cursor = number(arg(args, 1)?)? as u64;
                let count = option(args, "COUNT").map_or(Ok(10), number)? as usize;
                if cursor == 0 {
                    let fields = self
                        .hash(key)?
                        .map(|h| h.keys().cloned().collect())
                        .unwrap_or_default();
                    self.snapshot(fields);
                }
                let (next, page) = self.page(cursor, count);
                let hash = self.hash(key)?;
                let mut pairs = Vec::new();
                for field in page {
                    if let Some(value) = hash.and_then(|h| h.get(&field)) {
                        pairs.push(Value::Data(field.into_bytes()));
                        pairs.push(Value::Data(value.clone()));
                    }
                }
                Ok(Value::Bulk(vec![
                    Value::Data(next.to_string().into_bytes()),
                    Value::Bulk(pairs),
                ]))
            }
            "SCAN" => {
                if self.broken_scan {
                    return Ok(Value::Int(7));
                }
                let cursor = number(arg(args, 0)?)? as u64;
                let count = option(args, "COUNT").map_or(Ok(10), number)? as usize;
                let pattern = option(args, "MATCH").unwrap_or("*").to_owned();
                if cursor == 0 {
                    let mut keys: Vec<String> = self.keys.keys().cloned().collect();
                    keys.sort();
                    self.snapshot(keys);
                }
                let (next, page) = self.page(cursor, count);
                let keys = page
                    .into_iter()
                    .filter(|k| self.live(k).is_some() && glob(pattern.as_bytes(), k.as_bytes()))
                    .map(|k| Value::Data(k.into_bytes()))
                    .collect();
                Ok(Value::Bulk(vec![
                    Value::Data(next.to_string().into_bytes()),
                    Value::Bulk(keys),
                ]))
            }
            "ZADD" => {
                let key = arg(args, 0)?;
                let (mut gt, mut lt, mut nx, mut xx, mut ch) = (false, false, false, false, false);
                let mut i = 1;
                while let Some(flag) = args.get(i) {
                    match flag.to_ascii_uppercase().as_str() {
                        "GT" => gt = true,
                        "LT" => lt = true,
                        "NX" => nx = true,
                        "XX" => xx = true,
                        "CH" => ch = true,
                        _ => break,
                    }
                    i += 1;
                }
                if args.len() <= i || (args.len() - i) % 2 != 0 {
                    return Err(syntax());
                }
                let zset = self.zset_mut(key)?;
                let mut changed = 0;
                for pair in args[i..].chunks(2) {
                    let new = score(&pair[0])?;
                    let member = &pair[1];
                    match zset.get(member).copied() {
                        None if !xx => {
                            zset.insert(member.clone(), new);
                            changed += 1;
                        }
                        Some(old) if !nx => {
                            let update = (!gt || new > old) && (!lt || new < old);
                            if update && new != old {
                                zset.insert(member.clone(), new);
                                if ch {
                                    changed += 1;
                                }
                            }
                        }
                        _ => {}
                    }
                }
                self.drop_if_empty(key);
                Ok(Value::Int(changed))
            }
            "ZREM" => {
                let key = arg(args, 0)?;
                if self.live(key).is_none() {
                    return Ok(Value::Int(0));
                }
                let zset = self.zset_mut(key)?;
                let removed = args[1..].iter().filter(|m| zset.remove(*m).is_some()).count();
                self.drop_if_empty(key);
                Ok(Value::Int(removed as i64))
            }
            "ZSCORE" => {
                let key = arg(args, 0)?;
                let member = arg(args, 1)?;
                match self.live(key).map(|e| &e.data) {
                    Some(Data::ZSet(zset)) => Ok(zset
                        .get(member)
                        .map_or(Value::Nil, |s| Value::Data(s.to_string().into_bytes()))),
                    Some(_) => Err(wrong_type()),
                    None => Ok(Value::Nil),
                }
            }
            "ZRANGEBYSCORE" => {
                let key = arg(args, 0)?;
                let (min, min_open) = bound(arg(args, 1)?)?;
                let (max, max_open) = bound(arg(args, 2)?)?;
                let mut members: Vec<(f64, String)> = match self.live(key).map(|e| &e.data) {
                    Some(Data::ZSet(zset)) => zset
                        .iter()
                        .filter(|&(_, &s)| {
                            (if min_open { s > min } else { s >= min })
                                && (if max_open { s < max } else { s <= max })
                        })
                        .map(|(m, &s)| (s, m.clone()))
                        .collect(),
                    Some(_) => return Err(wrong_type()),
                    None => Vec::new(),
                };
                members.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
                Ok(Value::Bulk(
                    members
                        .into_iter()
                        .map(|(_, m)| Value::Data(m.into_bytes()))
                        .collect(),
                ))
            }
            "FLUSHDB" => {
                self.keys.clear();
                Ok(Value::Okay)
            }
            _ => Err(RedisError::from((
                ErrorKind::ResponseError,
                "unknown command",
                name.to_owned(),
            ))),
        }
    }

    fn snapshot(&mut self, items: Vec<String>) {
        self.next_snapshot += 1;
        self.snapshots.insert(self.next_snapshot, items);
    }

    /// Cursors carry the snapshot id in the high half and the position in the low half.
    fn page(&mut self, cursor: u64, count: usize) -> (u64, Vec<String>) {
        let (id, position) = if cursor == 0 {
            (self.next_snapshot, 0)
        } else {
            (cursor >> 32, (cursor & 0xffff_ffff) as usize)
        };
        let items = self.snapshots.get(&id).cloned().unwrap_or_default();
        let end = (position + count.max(1)).min(items.len());
        let page = items.get(position..end).map(<[String]>::to_vec).unwrap_or_default();
        if end >= items.len() {
            self.snapshots.remove(&id);
            (0, page)
        } else {
            ((id << 32) | end as u64, page)
        }
    }
}

fn parse(packed: &[u8]) -> RedisResult<Vec<Vec<Vec<u8>>>> {
    fn line(buf: &[u8], pos: &mut usize) -> RedisResult<i64> {
        let start = *pos + 1;
        let end = buf[start..]
            .windows(2)
            .position(|w| w == b"\r\n")
            .map(|i| start + i)
            .ok_or_else(protocol)?;
        *pos = end + 2;
        std::str::from_utf8(&buf[start..end])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(protocol)
    }

    let mut commands = Vec::new();
    let mut pos = 0;
    while pos < packed.len() {
        if packed[pos] != b'*' {
            return Err(protocol());
        }
        let argc = line(packed, &mut pos)?;
        let mut args = Vec::new();
        for _ in 0..argc {
            if packed.get(pos) != Some(&b'$') {
                return Err(protocol());
            }
            let len = line(packed, &mut pos)? as usize;
            args.push(packed.get(pos..pos + len).ok_or_else(protocol)?.to_vec());
            pos += len + 2;
        }
        commands.push(args);
    }
    Ok(commands)
}

fn glob(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((b'*', rest)) => (0..=text.len()).any(|i| glob(rest, &text[i..])),
        Some((b'?', rest)) => !text.is_empty() && glob(rest, &text[1..]),
        Some((b'\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob(&rest[1..], &text[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && glob(rest, &text[1..]),
    }
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn arg(args: &[String], index: usize) -> RedisResult<&String> {
    args.get(index).ok_or_else(syntax)
}

fn option<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a.eq_ignore_ascii_case(name))
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn number(value: &str) -> RedisResult<i64> {
    value.parse().map_err(|_| syntax())
}

fn score(value: &str) -> RedisResult<f64> {
    match value {
        "+inf" | "inf" => Ok(f64::INFINITY),
        "-inf" => Ok(f64::NEG_INFINITY),
        _ => value.parse().map_err(|_| syntax()),
    }
}

fn bound(value: &str) -> RedisResult<(f64, bool)> {
    match value.strip_prefix('(') {
        Some(rest) => Ok((score(rest)?, true)),
        None => Ok((score(value)?, false)),
    }
}

fn syntax() -> RedisError {
    RedisError::from((ErrorKind::ResponseError, "syntax error"))
}

fn protocol() -> RedisError {
    RedisError::from((ErrorKind::ClientError, "malformed packed command"))
}

fn wrong_type() -> RedisError {
    RedisError::from((ErrorKind::TypeError, "WRONGTYPE"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob() {
        assert!(glob(b"app:*", b"app:x"));
        assert!(glob(b"a?c", b"abc"));
        assert!(!glob(b"a?c", b"ac"));
        assert!(glob(b"*:entries", b"app:_any:tag:t:entries"));
        assert!(!glob(b"app:*", b"other"));
        assert!(glob(b"a\\*", b"a*"));
    }

    #[test]
    fn test_parse_packed() {
        let packed = redis::cmd("SET").arg("k").arg(b"v\r\n".as_slice()).get_packed_command();
        assert_eq!(
            parse(&packed).unwrap(),
            vec![vec![b"SET".to_vec(), b"k".to_vec(), b"v\r\n".to_vec()]]
        );
    }
}
