//! Parses a `Cache-Control` header value into a directive map.
//!
//! Grammar (informal, RFC 7230 token/quoted-string):
//! ```text
//! cc        := directive (OWS "," OWS directive)*
//! directive := token ("=" (token | quoted-string))?
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::Error;

/// RFC 7234 directives whose quoted argument is itself a comma-separated
/// list of header field names (`private`, `no-cache`). Only these split a
/// quoted value on interior commas; every other directive keeps a quoted
/// value verbatim, whitespace and all, so that e.g. `foo="max-age=8,
/// space"` round-trips as the single string `max-age=8, space` rather than
/// being torn into two fields it was never meant to name.
const FIELD_LIST_DIRECTIVES: &[&str] = &["private", "no-cache"];

/// A parsed `Cache-Control` header: lower-cased directive name to its
/// argument list. A bare directive (`public`) maps to an empty list; a
/// `key=token` directive maps to a one-element list; a quoted field-list
/// directive (`private="a, b"`) maps to the parsed, trimmed list of names.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CacheControl(HashMap<String, Vec<String>>);

impl CacheControl {
    pub fn parse(value: &str) -> Result<Self, Error> {
        let mut map = HashMap::new();
        for part in split_unquoted(value, ',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match find_unquoted(part, '=') {
                Some(idx) => {
                    let key = parse_key(&part[..idx])?;
                    let raw_value = part[idx + 1..].trim();
                    let values = parse_value(&key, raw_value)?;
                    map.insert(key, values);
                }
                None => {
                    let key = parse_key(part)?;
                    map.insert(key, Vec::new());
                }
            }
        }
        Ok(Self(map))
    }

    /// Parse every `Cache-Control` header line, comma-joining them first
    /// (a response may repeat the header).
    pub fn parse_all<'a>(lines: impl IntoIterator<Item = &'a str>) -> Result<Self, Error> {
        let joined = lines.into_iter().collect::<Vec<_>>().join(", ");
        Self::parse(&joined)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Parses the first argument of `key` as a count of seconds.
    pub fn duration(&self, key: &str) -> Option<Result<Duration, Error>> {
        let first = self.0.get(key)?.first()?;
        Some(
            first
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| Error::parse("cache-control duration", e.to_string())),
        )
    }

    pub fn insert(&mut self, key: impl Into<String>, values: Vec<String>) {
        self.0.insert(key.into(), values);
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }
}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, values) in &self.0 {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            write_token_or_quoted(f, key)?;
            match values.as_slice() {
                [] => {}
                [single] => {
                    write!(f, "=")?;
                    write_token_or_quoted(f, single)?;
                }
                many => {
                    write!(f, "=\"{}\"", many.join(", "))?;
                }
            }
        }
        Ok(())
    }
}

fn parse_key(raw: &str) -> Result<String, Error> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(Error::parse("cache-control key", "empty directive key"));
    }
    if let Some(inner) = unquote(raw)? {
        // Quoted keys are unusual; preserve them verbatim for round-tripping.
        Ok(inner)
    } else {
        Ok(raw.to_ascii_lowercase())
    }
}

fn parse_value(key: &str, raw: &str) -> Result<Vec<String>, Error> {
    if let Some(inner) = unquote(raw)? {
        if FIELD_LIST_DIRECTIVES.contains(&key) && inner.contains(',') {
            Ok(inner.split(',').map(|s| s.trim().to_string()).collect())
        } else {
            Ok(vec![inner])
        }
    } else {
        Ok(vec![raw.to_string()])
    }
}

/// Returns `Some(inner)` if `s` is a well-formed quoted-string, `None` if
/// it isn't quoted at all, or an error if the quoting is malformed.
fn unquote(s: &str) -> Result<Option<String>, Error> {
    if !s.starts_with('"') {
        return Ok(None);
    }
    if s.len() < 2 || !s.ends_with('"') {
        return Err(Error::parse("cache-control quoted-string", "unterminated quote"));
    }
    Ok(Some(s[1..s.len() - 1].to_string()))
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn needs_quoting(s: &str) -> bool {
    s.is_empty() || !s.chars().all(is_token_char)
}

fn write_token_or_quoted(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    if needs_quoting(s) {
        write!(f, "\"{s}\"")
    } else {
        write!(f, "{s}")
    }
}

/// Splits `s` on `sep` at the top level only, treating a `"..."` run as
/// opaque (a separator inside quotes does not split).
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                parts.push(&s[start..idx]);
                start = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Finds the first occurrence of `target` outside of a quoted run.
fn find_unquoted(s: &str, target: char) -> Option<usize> {
    let mut in_quotes = false;
    for (idx, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c == target && !in_quotes => return Some(idx),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc(pairs: &[(&str, &[&str])]) -> CacheControl {
        let mut map = HashMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.iter().map(|s| s.to_string()).collect());
        }
        CacheControl(map)
    }

    #[test]
    fn s1_parses_mixed_directives() {
        let got = CacheControl::parse(r#"public, private="set-cookie", max-age=100"#).unwrap();
        let want = cc(&[("public", &[]), ("private", &["set-cookie"]), ("max-age", &["100"])]);
        assert_eq!(got, want);
    }

    #[test]
    fn s2_preserves_unknown_quoted_whitespace() {
        let got = CacheControl::parse(r#" foo="max-age=8, space",  public"#).unwrap();
        let want = cc(&[("foo", &["max-age=8, space"]), ("public", &[])]);
        assert_eq!(got, want);
    }

    #[test]
    fn splits_known_field_list_directive_on_comma() {
        let got = CacheControl::parse(r#"private="set-cookie,foo""#).unwrap();
        let want = cc(&[("private", &["set-cookie", "foo"])]);
        assert_eq!(got, want);
    }

    #[test]
    fn odd_quoted_key_round_trips() {
        let got = CacheControl::parse(r#"" max-age=8,max-age=8 "=blah"#).unwrap();
        let want = cc(&[(" max-age=8,max-age=8 ", &["blah"])]);
        assert_eq!(got, want);
    }

    #[test]
    fn duplicate_keys_last_one_wins() {
        let got = CacheControl::parse("max-age=1, max-age=2").unwrap();
        assert_eq!(got.get("max-age"), Some(&["2".to_string()][..]));
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert!(CacheControl::parse(r#"private="set-cookie"#).is_err());
    }

    #[test]
    fn round_trip_law() {
        for input in [
            r#"public, private="set-cookie", max-age=100"#,
            r#"s-maxage=86400"#,
            r#"max-stale"#,
            r#"max-stale=60"#,
            r#"no-cache="set-cookie,x-foo""#,
        ] {
            let parsed = CacheControl::parse(input).unwrap();
            let reparsed = CacheControl::parse(&parsed.to_string()).unwrap();
            assert_eq!(parsed, reparsed, "round trip failed for {input:?}");
        }
    }
}
