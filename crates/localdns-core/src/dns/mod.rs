use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HostsError {
    #[error("line {line}: expected `<address> <hostname>`, got {tokens} token(s)")]
    BadLine { line: usize, tokens: usize },
    #[error("line {line}: invalid IPv4 address `{address}`")]
    BadAddress { line: usize, address: String },
    #[error("line {line}: hostname is empty")]
    EmptyHostname { line: usize },
}

/// Ordered list of overrides as they appear in the hosts text.
pub type HostEntries = Vec<(String, Ipv4Addr)>;

/// Domain → address override table consulted before real DNS resolution.
///
/// Readers get a consistent snapshot; `replace` swaps the whole mapping in one
/// store, so a lookup never observes a half-applied reload.
pub struct HostTable {
    entries: ArcSwap<HashMap<String, Ipv4Addr>>,
}

impl HostTable {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Ipv4Addr)>,
        S: AsRef<str>,
    {
        let table = Self::new();
        table.replace(entries);
        table
    }

    /// Replace the live table. Later duplicates override earlier ones.
    pub fn replace<I, S>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (S, Ipv4Addr)>,
        S: AsRef<str>,
    {
        let map: HashMap<String, Ipv4Addr> = entries
            .into_iter()
            .map(|(name, addr)| (normalize_domain(name.as_ref()), addr))
            .collect();
        let len = map.len();
        self.entries.store(Arc::new(map));
        tracing::info!(entries = len, "host table replaced");
        len
    }

    /// Parse hosts text and install it. The live table is untouched on error.
    pub fn reload_from_str(&self, text: &str) -> Result<usize, HostsError> {
        let entries = parse_hosts(text)?;
        Ok(self.replace(entries))
    }

    /// Exact, case-sensitive match against a fully-qualified name.
    pub fn lookup(&self, name: &str) -> Option<Ipv4Addr> {
        self.entries.load().get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.load().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.load().is_empty()
    }
}

impl Default for HostTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `<address> <hostname>` lines.
///
/// Every line must be exactly two whitespace-separated tokens; a blank or
/// comment line fails the whole parse like any other malformed line.
pub fn parse_hosts(text: &str) -> Result<HostEntries, HostsError> {
    let mut entries = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.len() != 2 {
            return Err(HostsError::BadLine {
                line: line_no,
                tokens: tokens.len(),
            });
        }

        let address: Ipv4Addr = tokens[0].parse().map_err(|_| HostsError::BadAddress {
            line: line_no,
            address: tokens[0].to_string(),
        })?;

        let host = normalize_domain(tokens[1]);
        if host == "." {
            return Err(HostsError::EmptyHostname { line: line_no });
        }

        entries.push((host, address));
    }

    Ok(entries)
}

/// Append the root label if missing: `example.com` → `example.com.`
pub fn normalize_domain(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_and_lookup() {
        let table = HostTable::new();
        table.replace([("example.com.", Ipv4Addr::new(1, 2, 3, 4))]);

        assert_eq!(table.lookup("example.com."), Some(Ipv4Addr::new(1, 2, 3, 4)));
        assert_eq!(table.lookup("other.com."), None);
    }

    #[test]
    fn test_lookup_is_exact_and_case_sensitive() {
        let table = HostTable::from_entries([("example.com", Ipv4Addr::new(1, 2, 3, 4))]);

        assert!(table.contains("example.com."));
        assert_eq!(table.lookup("Example.com."), None);
        assert_eq!(table.lookup("www.example.com."), None);
        assert_eq!(table.lookup("example.com"), None);
    }

    #[test]
    fn test_replace_drops_previous_entries() {
        let table = HostTable::from_entries([("a.test.", Ipv4Addr::new(10, 0, 0, 1))]);
        table.replace([("b.test.", Ipv4Addr::new(10, 0, 0, 2))]);

        assert_eq!(table.lookup("a.test."), None);
        assert_eq!(table.lookup("b.test."), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_hosts() {
        let text = "\
127.0.0.1   localhost.test
0.0.0.0\tblocked.example.
10.0.0.5 blocked.example
";
        let entries = parse_hosts(text).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], ("localhost.test.".to_string(), Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(entries[1].0, "blocked.example.");

        // later duplicate wins
        let table = HostTable::from_entries(entries);
        assert_eq!(table.lookup("blocked.example."), Some(Ipv4Addr::new(10, 0, 0, 5)));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert_eq!(
            parse_hosts("1.2.3.4 a.test b.test"),
            Err(HostsError::BadLine { line: 1, tokens: 3 })
        );
        assert_eq!(
            parse_hosts("1.2.3.4 a.test\nonlyonetoken"),
            Err(HostsError::BadLine { line: 2, tokens: 1 })
        );
        assert!(matches!(
            parse_hosts("not-an-ip a.test"),
            Err(HostsError::BadAddress { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_rejects_blank_and_comment_lines() {
        assert_eq!(
            parse_hosts("1.2.3.4 a.test\n\n5.6.7.8 b.test"),
            Err(HostsError::BadLine { line: 2, tokens: 0 })
        );
        assert_eq!(
            parse_hosts("# my overrides\n1.2.3.4 a.test"),
            Err(HostsError::BadLine { line: 1, tokens: 3 })
        );
        assert!(parse_hosts("# a\n1.2.3.4 a.test").is_err());

        // a final line terminator is not a line of its own
        assert_eq!(parse_hosts("1.2.3.4 a.test\r\n").unwrap().len(), 1);
        assert_eq!(parse_hosts("").unwrap(), Vec::new());
    }

    #[test]
    fn test_failed_reload_keeps_live_table() {
        let table = HostTable::from_entries([("keep.test.", Ipv4Addr::new(1, 1, 1, 1))]);

        let result = table.reload_from_str("2.2.2.2 new.test\nbroken line here");
        assert!(result.is_err());
        assert_eq!(table.lookup("keep.test."), Some(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(table.lookup("new.test."), None);

        assert_eq!(table.reload_from_str("2.2.2.2 new.test").unwrap(), 1);
        assert_eq!(table.lookup("keep.test."), None);
    }
}
