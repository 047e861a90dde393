//! One handler per verb. Handlers read their arguments, mutate the
//! keyspace, and return a typed [`Reply`]; the connection layer serializes
//! it. Dispatch is on exact (verb, arity); anything else is unknown.

use std::rc::Rc;

use crate::db::Db;
use crate::map::{Entry, Value};
use crate::monotonic_ms;
use crate::protocol::{ErrCode, Reply};
use crate::zset::{znode_offset, ZSet};

pub fn do_request(db: &mut Db, cmd: &[Vec<u8>]) -> Reply {
    let verb = cmd.first().map(Vec::as_slice).unwrap_or(b"");
    match (verb, cmd.len()) {
        (b"get", 2) => do_get(db, &cmd[1]),
        (b"set", 3) => do_set(db, &cmd[1], &cmd[2]),
        (b"del", 2) => do_del(db, &cmd[1]),
        (b"pexpire", 3) => do_pexpire(db, &cmd[1], &cmd[2]),
        (b"pttl", 2) => do_pttl(db, &cmd[1]),
        (b"zadd", 4) => do_zadd(db, &cmd[1], &cmd[2], &cmd[3]),
        (b"zrem", 3) => do_zrem(db, &cmd[1], &cmd[2]),
        (b"zscore", 3) => do_zscore(db, &cmd[1], &cmd[2]),
        (b"zquery", 6) => do_zquery(db, &cmd[1], &cmd[2], &cmd[3], &cmd[4], &cmd[5]),
        (b"keys", 1) => do_keys(db),
        _ => Reply::Err(ErrCode::Unknown, "unknown command"),
    }
}

fn parse_int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_float(arg: &[u8]) -> Option<f64> {
    let v: f64 = std::str::from_utf8(arg).ok()?.parse().ok()?;
    v.is_finite().then_some(v)
}

fn do_get(db: &mut Db, key: &[u8]) -> Reply {
    let Some(entry) = db.map.lookup(key) else {
        return Reply::Nil;
    };
    let reply = match &*entry.value.borrow() {
        Value::Str(s) => Reply::Str(s.clone()),
        Value::ZSet(_) => Reply::Err(ErrCode::BadTyp, "not a string value"),
    };
    reply
}

fn do_set(db: &mut Db, key: &[u8], val: &[u8]) -> Reply {
    match db.map.lookup(key) {
        Some(entry) => {
            let mut value = entry.value.borrow_mut();
            match &mut *value {
                Value::Str(s) => {
                    *s = val.to_vec();
                    Reply::Nil
                }
                Value::ZSet(_) => Reply::Err(ErrCode::BadTyp, "a zset value exists"),
            }
        }
        None => {
            db.map.insert(Entry::new(key, Value::Str(val.to_vec())));
            Reply::Nil
        }
    }
}

fn do_del(db: &mut Db, key: &[u8]) -> Reply {
    Reply::Int(db.del_key(key) as i64)
}

fn do_pexpire(db: &mut Db, key: &[u8], ttl: &[u8]) -> Reply {
    let Some(ttl_ms) = parse_int(ttl) else {
        return Reply::Err(ErrCode::BadArg, "expect int64");
    };
    match db.map.lookup(key) {
        Some(entry) => {
            db.set_ttl(&entry, ttl_ms);
            Reply::Int(1)
        }
        None => Reply::Int(0),
    }
}

fn do_pttl(db: &mut Db, key: &[u8]) -> Reply {
    let Some(entry) = db.map.lookup(key) else {
        return Reply::Int(-2);
    };
    match db.ttl_remaining(&entry, monotonic_ms()) {
        Some(remaining) => Reply::Int(remaining as i64),
        None => Reply::Int(-1),
    }
}

/// Resolve a key to its sorted set: `Ok(None)` when the key is absent,
/// type error when it holds a string.
fn expect_zset(db: &mut Db, key: &[u8]) -> Result<Option<Rc<Entry>>, Reply> {
    let Some(entry) = db.map.lookup(key) else {
        return Ok(None);
    };
    if !matches!(&*entry.value.borrow(), Value::ZSet(_)) {
        return Err(Reply::Err(ErrCode::BadTyp, "expect zset"));
    }
    Ok(Some(entry))
}

fn do_zadd(db: &mut Db, key: &[u8], score: &[u8], name: &[u8]) -> Reply {
    let Some(score) = parse_float(score) else {
        return Reply::Err(ErrCode::BadArg, "expect float");
    };
    let entry = match expect_zset(db, key) {
        Ok(Some(entry)) => entry,
        Ok(None) => {
            // Auto-create on first zadd.
            let entry = Entry::new(key, Value::ZSet(ZSet::new()));
            db.map.insert(Rc::clone(&entry));
            entry
        }
        Err(err) => return err,
    };
    let mut value = entry.value.borrow_mut();
    let Value::ZSet(zset) = &mut *value else {
        unreachable!("expect_zset only passes zset entries");
    };
    Reply::Int(zset.insert(name, score) as i64)
}

fn do_zrem(db: &mut Db, key: &[u8], name: &[u8]) -> Reply {
    let entry = match expect_zset(db, key) {
        Ok(Some(entry)) => entry,
        Ok(None) => return Reply::Int(0),
        Err(err) => return err,
    };
    let mut value = entry.value.borrow_mut();
    let Value::ZSet(zset) = &mut *value else {
        unreachable!("expect_zset only passes zset entries");
    };
    Reply::Int(zset.delete(name) as i64)
}

fn do_zscore(db: &mut Db, key: &[u8], name: &[u8]) -> Reply {
    let entry = match expect_zset(db, key) {
        Ok(Some(entry)) => entry,
        Ok(None) => return Reply::Nil,
        Err(err) => return err,
    };
    let value = entry.value.borrow();
    let Value::ZSet(zset) = &*value else {
        unreachable!("expect_zset only passes zset entries");
    };
    match zset.lookup(name) {
        Some(node) => Reply::Dbl(node.lock().unwrap().score),
        None => Reply::Nil,
    }
}

fn do_zquery(
    db: &mut Db,
    key: &[u8],
    score: &[u8],
    name: &[u8],
    offset: &[u8],
    limit: &[u8],
) -> Reply {
    let Some(score) = parse_float(score) else {
        return Reply::Err(ErrCode::BadArg, "expect float");
    };
    let (Some(offset), Some(limit)) = (parse_int(offset), parse_int(limit)) else {
        return Reply::Err(ErrCode::BadArg, "expect int64");
    };
    if limit < 0 {
        return Reply::Err(ErrCode::BadArg, "negative limit");
    }

    let entry = match expect_zset(db, key) {
        Ok(Some(entry)) => entry,
        Ok(None) => return Reply::Arr(Vec::new()),
        Err(err) => return err,
    };
    let value = entry.value.borrow();
    let Value::ZSet(zset) = &*value else {
        unreachable!("expect_zset only passes zset entries");
    };

    let mut node = zset
        .seek_ge(score, name)
        .and_then(|start| znode_offset(&start, offset));
    let mut out = Vec::new();
    let mut remaining = limit;
    while let Some(cur) = node {
        if remaining == 0 {
            break;
        }
        {
            let n = cur.lock().unwrap();
            out.push(Reply::Str(n.name.to_vec()));
            out.push(Reply::Dbl(n.score));
        }
        remaining -= 1;
        node = znode_offset(&cur, 1);
    }
    Reply::Arr(out)
}

fn do_keys(db: &mut Db) -> Reply {
    let mut out = Vec::new();
    db.map.for_each(|entry| {
        out.push(Reply::Str(entry.key.to_vec()));
    });
    Reply::Arr(out)
}
