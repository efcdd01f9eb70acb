//! Header and query-parameter multimaps.
//!
//! Both types preserve insertion order and repeated keys, which HTTP
//! semantics require and hash maps silently destroy. Header name matching
//! is ASCII case-insensitive; stored names keep their original casing.

use percent_encoding::percent_decode_str;
use smallvec::SmallVec;

/// Values for one header name. Most headers carry a single value, so the
/// first slot is stored inline.
pub type HeaderValues<'a> = SmallVec<[&'a str; 1]>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeaderEntry {
    name: String,
    value: String,
}

/// Insertion-ordered, case-insensitive HTTP header multimap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<HeaderEntry>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header entry, keeping any existing values for the name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(HeaderEntry {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Replace all values for a name with a single value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.add(name, value);
    }

    /// Remove every value for a name. Returns how many entries were dropped.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(name));
        before - self.entries.len()
    }

    /// First value for a name, in insertion order.
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// All values for a name, in insertion order.
    pub fn all(&self, name: &str) -> HeaderValues<'_> {
        self.entries
            .iter()
            .filter(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Number of entries (not unique names).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate entries as they were inserted.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

/// Query parameters parsed from a raw query string.
///
/// Repeated keys and their relative order are preserved. Keys and values
/// are percent-decoded, with `+` decoded as space.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    entries: Vec<(String, String)>,
}

impl QueryParams {
    /// Parse the part of a URI after `?`. `None` yields an empty set.
    pub fn parse(query: Option<&str>) -> Self {
        let mut entries = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.split_once('=') {
                    Some((key, value)) => entries.push((decode(key), decode(value))),
                    None => entries.push((decode(pair), String::new())),
                }
            }
        }
        Self { entries }
    }

    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn decode(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_preserve_insertion_order() {
        let mut headers = Headers::new();
        headers.add("Accept", "text/html");
        headers.add("Cookie", "a=1");
        headers.add("Cookie", "b=2");

        let collected: Vec<_> = headers.iter().collect();
        assert_eq!(
            collected,
            vec![("Accept", "text/html"), ("Cookie", "a=1"), ("Cookie", "b=2")]
        );
        assert_eq!(headers.all("cookie").as_slice(), &["a=1", "b=2"]);
    }

    #[test]
    fn test_headers_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.add("Content-Length", "42");
        assert_eq!(headers.first("content-length"), Some("42"));
        assert!(headers.contains("CONTENT-LENGTH"));
        assert_eq!(headers.remove("content-LENGTH"), 1);
        assert!(headers.is_empty());
    }

    #[test]
    fn test_headers_set_replaces_all_values() {
        let mut headers = Headers::new();
        headers.add("X-Flag", "a");
        headers.add("x-flag", "b");
        headers.set("X-Flag", "c");
        assert_eq!(headers.all("x-flag").as_slice(), &["c"]);
    }

    #[test]
    fn test_query_params_repeats_and_order() {
        let params = QueryParams::parse(Some("a=1&b=2&a=3"));
        assert_eq!(params.first("a"), Some("1"));
        assert_eq!(params.all("a"), vec!["1", "3"]);
        let collected: Vec<_> = params.iter().collect();
        assert_eq!(collected, vec![("a", "1"), ("b", "2"), ("a", "3")]);
    }

    #[test]
    fn test_query_params_decoding() {
        let params = QueryParams::parse(Some("q=hello+world&path=%2Ftmp%2Fx&flag"));
        assert_eq!(params.first("q"), Some("hello world"));
        assert_eq!(params.first("path"), Some("/tmp/x"));
        assert_eq!(params.first("flag"), Some(""));
    }

    #[test]
    fn test_query_params_none_is_empty() {
        assert!(QueryParams::parse(None).is_empty());
        assert!(QueryParams::parse(Some("")).is_empty());
    }
}
