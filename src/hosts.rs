use std::collections::HashMap;
use std::net::IpAddr;

/// Hostname to address map backing the hijack evaluator.
///
/// Names are stored lowercased and without a trailing dot, so lookups match
/// regardless of how the query spelled the name.
#[derive(Debug, Clone, Default)]
pub struct Hosts {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl Hosts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses hosts-file formatted text: an address followed by one or more
    /// names per line, `#` starts a comment. Lines without a parsable address
    /// are skipped; ad-list sources routinely contain stray markup.
    pub fn parse(input: &str) -> Hosts {
        let mut hosts = Hosts::new();
        for line in input.lines() {
            let line = line.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in fields {
                hosts.insert(name, addr);
            }
        }
        hosts
    }

    pub fn insert(&mut self, name: &str, addr: IpAddr) {
        self.entries.entry(canonical(name)).or_default().push(addr);
    }

    pub fn get(&self, name: &str) -> Option<&[IpAddr]> {
        self.entries.get(&canonical(name)).map(Vec::as_slice)
    }

    /// Removes a name from the map; returns whether it was present.
    pub fn del(&mut self, name: &str) -> bool {
        self.entries.remove(&canonical(name)).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Merges another map into this one, appending addresses for shared names.
    pub fn extend(&mut self, other: Hosts) {
        for (name, addrs) in other.entries {
            self.entries.entry(name).or_default().extend(addrs);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn canonical(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}
