//! Typed optional-field access over untrusted JSON.
//!
//! Every accessor takes the default explicitly. A missing key, a null, or a
//! value of the wrong shape yields the default; nothing here panics or errors.

use serde_json::Value;

/// Cursor into a JSON document that may point at nothing.
#[derive(Debug, Clone, Copy)]
pub struct Field<'a>(Option<&'a Value>);

impl<'a> Field<'a> {
    pub fn of(value: &'a Value) -> Self {
        Self(Some(value))
    }

    pub fn missing() -> Self {
        Self(None)
    }

    pub fn get(&self, key: &str) -> Field<'a> {
        Field(self.0.and_then(|v| v.get(key)))
    }

    pub fn path(&self, keys: &[&str]) -> Field<'a> {
        keys.iter().fold(*self, |field, key| field.get(key))
    }

    pub fn index(&self, i: usize) -> Field<'a> {
        Field(self.0.and_then(|v| v.get(i)))
    }

    /// Present and not null.
    pub fn is_present(&self) -> bool {
        matches!(self.0, Some(v) if !v.is_null())
    }

    pub fn raw(&self) -> Option<&'a Value> {
        self.0.filter(|v| !v.is_null())
    }

    pub fn str_or(&self, default: &str) -> String {
        match self.0 {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            Some(Value::Bool(b)) => b.to_string(),
            _ => default.to_string(),
        }
    }

    pub fn f64_or(&self, default: f64) -> f64 {
        match self.0 {
            Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(default),
            Some(Value::String(s)) => parse_number(s).unwrap_or(default),
            _ => default,
        }
    }

    /// Integers are taken as-is; fractional values are rounded.
    pub fn i64_or(&self, default: i64) -> i64 {
        match self.0 {
            Some(Value::Number(n)) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
                .unwrap_or(default),
            Some(Value::String(s)) => parse_number(s).map(|f| f.round() as i64).unwrap_or(default),
            _ => default,
        }
    }

    pub fn bool_or(&self, default: bool) -> bool {
        match self.0 {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    pub fn array_or_empty(&self) -> &'a [Value] {
        self.0
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// A percentage in 0..=100, accepting `12.5`, `"12.5"` or `"12.5%"`.
    /// Out-of-range values yield the default.
    pub fn percent_or(&self, default: f64) -> f64 {
        let value = self.f64_or(f64::NAN);
        if (0.0..=100.0).contains(&value) {
            value
        } else {
            default
        }
    }
}

/// Parse "1,234", "12.5%" and similar display strings.
fn parse_number(s: &str) -> Option<f64> {
    let cleaned: String = s
        .trim()
        .trim_end_matches('%')
        .chars()
        .filter(|c| *c != ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_and_null_use_defaults() {
        let doc = json!({"a": null, "b": {"c": 3}});
        let root = Field::of(&doc);
        assert_eq!(root.get("a").str_or("x"), "x");
        assert_eq!(root.get("missing").i64_or(7), 7);
        assert_eq!(root.path(&["b", "c"]).i64_or(0), 3);
        assert_eq!(root.path(&["b", "c", "d"]).f64_or(1.5), 1.5);
        assert!(root.get("a").array_or_empty().is_empty());
        assert!(!root.get("a").is_present());
    }

    #[test]
    fn test_numeric_strings() {
        let doc = json!({"n": "1,234", "p": "12.5%", "f": 2.6, "bad": "n/a"});
        let root = Field::of(&doc);
        assert_eq!(root.get("n").i64_or(0), 1234);
        assert_eq!(root.get("p").percent_or(0.0), 12.5);
        assert_eq!(root.get("f").i64_or(0), 3);
        assert_eq!(root.get("bad").f64_or(0.0), 0.0);
        assert_eq!(root.get("f").str_or(""), "2.6");
    }

    #[test]
    fn test_percent_range() {
        let doc = json!({"over": 150, "neg": -1, "ok": 45});
        let root = Field::of(&doc);
        assert_eq!(root.get("over").percent_or(0.0), 0.0);
        assert_eq!(root.get("neg").percent_or(0.0), 0.0);
        assert_eq!(root.get("ok").percent_or(0.0), 45.0);
    }

    #[test]
    fn test_bool_variants() {
        let doc = json!({"t": "true", "one": 1, "zero": 0, "junk": "maybe"});
        let root = Field::of(&doc);
        assert!(root.get("t").bool_or(false));
        assert!(root.get("one").bool_or(false));
        assert!(!root.get("zero").bool_or(true));
        assert!(root.get("junk").bool_or(true));
    }
}
