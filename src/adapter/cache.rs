//! Per-adapter metric cache

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

pub const ALIVE: &str = "alive";
pub const DELAY: &str = "delay";
pub const SPEED: &str = "speed";
pub const SPEED_STR: &str = "speed_str";

/// Late-bound key/value store, typed on read
#[derive(Debug, Default)]
pub struct MetricCache {
    values: Mutex<HashMap<String, Value>>,
}

impl MetricCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, key: &str, value: impl Into<Value>) {
        self.values.lock().insert(key.to_string(), value.into());
    }

    pub fn load(&self, key: &str) -> Option<Value> {
        self.values.lock().get(key).cloned()
    }

    /// `true`/`1` and any other non-empty string are true; `false`, `0`
    /// and the empty string are false
    pub fn load_bool(&self, key: &str) -> bool {
        match self.load(key) {
            Some(Value::Bool(b)) => b,
            Some(Value::String(s)) => !matches!(s.trim(), "" | "0" | "false"),
            Some(Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            _ => false,
        }
    }

    /// Saturates into `0..=u16::MAX`
    pub fn load_u16(&self, key: &str) -> u16 {
        let value = self.load_f64(key);
        if value.is_nan() || value <= 0.0 {
            0
        } else if value >= f64::from(u16::MAX) {
            u16::MAX
        } else {
            value as u16
        }
    }

    pub fn load_f64(&self, key: &str) -> f64 {
        match self.load(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
            Some(Value::Bool(b)) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn load_string(&self, key: &str) -> String {
        match self.load(key) {
            Some(Value::String(s)) => s,
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        }
    }

    pub fn delete(&self, key: &str) {
        self.values.lock().remove(key);
    }

    pub fn reset(&self) {
        self.values.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_coercion() {
        let cache = MetricCache::new();
        assert!(!cache.load_bool(ALIVE));

        for (value, expected) in [
            (Value::from("true"), true),
            (Value::from("1"), true),
            (Value::from("yes"), true),
            (Value::from("false"), false),
            (Value::from("0"), false),
            (Value::from(""), false),
            (Value::from(2), true),
            (Value::from(0), false),
        ] {
            cache.store(ALIVE, value.clone());
            assert_eq!(cache.load_bool(ALIVE), expected, "{:?}", value);
        }
    }

    #[test]
    fn test_numeric_coercion() {
        let cache = MetricCache::new();
        cache.store(DELAY, "120");
        assert_eq!(cache.load_u16(DELAY), 120);

        cache.store(DELAY, 70_000);
        assert_eq!(cache.load_u16(DELAY), u16::MAX);

        cache.store(DELAY, -5);
        assert_eq!(cache.load_u16(DELAY), 0);

        cache.store(SPEED, "12.5");
        assert_eq!(cache.load_f64(SPEED), 12.5);

        cache.store(SPEED, serde_json::json!({"x": 1}));
        assert_eq!(cache.load_f64(SPEED), 0.0);
    }

    #[test]
    fn test_delete_and_reset() {
        let cache = MetricCache::new();
        cache.store(SPEED_STR, "1.00Mbps");
        cache.store(DELAY, 10);
        assert_eq!(cache.load_string(SPEED_STR), "1.00Mbps");

        cache.delete(SPEED_STR);
        assert!(cache.load(SPEED_STR).is_none());
        assert_eq!(cache.load_u16(DELAY), 10);

        cache.reset();
        assert!(cache.load(DELAY).is_none());
    }
}
