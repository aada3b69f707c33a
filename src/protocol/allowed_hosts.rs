//! Exact-match table plus glob wildcard list for RCPT domain policy (§4.F).

use std::sync::Mutex;

/// Matches a recipient domain against an exact-match table and a list of
/// `*`-wildcard glob patterns, both case-insensitive.
///
/// A table consisting only of `.` or `*` disables host checking (accept
/// any). Rebuilding is guarded by a mutex since both the exact-match set
/// and the wildcard list are swapped together.
pub struct AllowedHosts {
    inner: Mutex<Inner>,
}

struct Inner {
    accept_all: bool,
    exact: Vec<String>,
    globs: Vec<String>,
}

impl AllowedHosts {
    pub fn new(hosts: &[String]) -> Self {
        AllowedHosts {
            inner: Mutex::new(Inner::build(hosts)),
        }
    }

    /// Replaces the host table, used by the `AllowedHosts` hot-reload event.
    pub fn set(&self, hosts: &[String]) {
        let mut inner = self.inner.lock().expect("allowed hosts mutex poisoned");
        *inner = Inner::build(hosts);
    }

    /// `true` if `domain` is permitted to receive mail.
    pub fn is_allowed(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        let inner = self.inner.lock().expect("allowed hosts mutex poisoned");
        if inner.accept_all {
            return true;
        }
        if inner.exact.iter().any(|h| h == &domain) {
            return true;
        }
        inner.globs.iter().any(|pattern| glob_match(pattern, &domain))
    }
}

impl Inner {
    fn build(hosts: &[String]) -> Self {
        if hosts.is_empty() || hosts.iter().any(|h| h == "." || h == "*") {
            return Inner {
                accept_all: true,
                exact: Vec::new(),
                globs: Vec::new(),
            };
        }

        let mut exact = Vec::new();
        let mut globs = Vec::new();
        for host in hosts {
            let host = host.to_ascii_lowercase();
            if host.contains('*') {
                globs.push(host);
            } else {
                exact.push(host);
            }
        }

        Inner {
            accept_all: false,
            exact,
            globs,
        }
    }
}

/// A tiny shell-style `*` glob matcher; `*` matches any run of characters
/// (including none), everything else matches literally.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    match_from(&pattern, &text)
}

fn match_from(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            match_from(&pattern[1..], text)
                || (!text.is_empty() && match_from(pattern, &text[1..]))
        }
        Some(c) => text.first() == Some(c) && match_from(&pattern[1..], &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_table_accepts_all() {
        let hosts = AllowedHosts::new(&[]);
        assert!(hosts.is_allowed("anything.example.com"));
    }

    #[test]
    fn dot_disables_checking() {
        let hosts = AllowedHosts::new(&[".".to_string()]);
        assert!(hosts.is_allowed("anything.example.com"));
    }

    #[test]
    fn star_disables_checking() {
        let hosts = AllowedHosts::new(&["*".to_string()]);
        assert!(hosts.is_allowed("anything.example.com"));
    }

    #[test]
    fn exact_match_is_case_insensitive() {
        let hosts = AllowedHosts::new(&["Example.com".to_string()]);
        assert!(hosts.is_allowed("example.COM"));
        assert!(!hosts.is_allowed("other.com"));
    }

    #[test]
    fn wildcard_pattern_matches_suffix() {
        let hosts = AllowedHosts::new(&["*.example.com".to_string()]);
        assert!(hosts.is_allowed("mail.example.com"));
        assert!(!hosts.is_allowed("example.com"));
        assert!(!hosts.is_allowed("mail.example.org"));
    }

    #[test]
    fn reload_replaces_table() {
        let hosts = AllowedHosts::new(&["a.com".to_string()]);
        assert!(hosts.is_allowed("a.com"));
        assert!(!hosts.is_allowed("b.com"));
        hosts.set(&["b.com".to_string()]);
        assert!(!hosts.is_allowed("a.com"));
        assert!(hosts.is_allowed("b.com"));
    }
}
