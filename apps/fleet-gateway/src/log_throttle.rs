//! Rate limits for warnings that can fire once per frame or per write.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ThrottleKind {
    ProxyOverflow,
    BroadcastFailure,
}

impl ThrottleKind {
    fn interval(self) -> Duration {
        match self {
            ThrottleKind::ProxyOverflow => Duration::from_secs(10),
            ThrottleKind::BroadcastFailure => Duration::from_secs(30),
        }
    }
}

#[derive(Eq, PartialEq, Hash)]
struct LogKey {
    kind: ThrottleKind,
    key: String,
}

static LOG_MEMORY: Lazy<Mutex<HashMap<LogKey, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Returns `true` at most once per kind interval for the given key.
pub fn should_log(kind: ThrottleKind, key: &str) -> bool {
    let mut guard = LOG_MEMORY.lock();
    let key = LogKey {
        kind,
        key: key.to_string(),
    };
    let now = Instant::now();
    if let Some(last) = guard.get(&key) {
        if now.duration_since(*last) < kind.interval() {
            return false;
        }
    }
    guard.insert(key, now);
    true
}

/// Drop remembered keys, e.g. when a session or connection goes away.
pub fn forget(kind: ThrottleKind, key: &str) {
    LOG_MEMORY.lock().remove(&LogKey {
        kind,
        key: key.to_string(),
    });
}
