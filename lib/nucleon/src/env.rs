use hashbrown::HashMap;
use std::sync::Mutex;

/// Process-wide string key/value configuration store. Keys are set once at
/// boot (from the config file) and by the `SETENV` command; a key that is
/// already present cannot be overwritten.
pub struct Env {
    store: Mutex<HashMap<Box<str>, Box<str>>>,
}

impl Env {
    #[inline]
    pub fn new() -> Env {
        Env {
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Look up a key, returning an owned copy of the value.
    #[inline]
    pub fn get(&self, key: &str) -> Option<String> {
        let store = self.store.lock().unwrap();
        store.get(key).map(|v| v.to_string())
    }

    /// Set a key. Returns false (and leaves the store untouched) if the key
    /// already exists.
    #[inline]
    pub fn set(&self, key: &str, value: &str) -> bool {
        let mut store = self.store.lock().unwrap();
        if store.contains_key(key) {
            return false;
        }
        store.insert(key.into(), value.into());
        true
    }

    /// Integer accessor with a default. A missing key is recorded with the
    /// default so later readers observe the same value.
    #[inline]
    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(v) => v.parse().unwrap_or(default),
            None => {
                self.set(key, &default.to_string());
                default
            }
        }
    }

    /// Boolean accessor with a default, same recording behavior as `get_int`.
    #[inline]
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => v == "true" || v == "1",
            None => {
                self.set(key, if default { "true" } else { "false" });
                default
            }
        }
    }
}
