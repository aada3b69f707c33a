//! Parses RFC-5321-style path arguments for `MAIL FROM:` / `RCPT TO:`.

use std::fmt;

/// Limits enforced while parsing a path, per spec.
pub const MAX_LOCAL_PART_LEN: usize = 64;
pub const MAX_DOMAIN_LEN: usize = 255;
pub const MAX_PATH_LEN: usize = 256;

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    LocalPartTooLong,
    DomainTooLong,
    PathTooLong,
    Malformed,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::LocalPartTooLong => write!(f, "local part too long"),
            ParseError::DomainTooLong => write!(f, "domain too long"),
            ParseError::PathTooLong => write!(f, "path too long"),
            ParseError::Malformed => write!(f, "malformed address"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed reverse-path or forward-path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Address {
    pub local_part: String,
    pub domain: String,
    /// Source-route / "at domain list" prefix, e.g. `@a,@b:` — kept verbatim
    /// and otherwise ignored, per RFC 5321 §4.1.1.2.
    pub adl: String,
    /// Raw `MAIL FROM:<...> KEY=VALUE ...` parameters, verbatim.
    pub params: Vec<(String, String)>,
    /// `true` for the null reverse-path `<>`.
    pub null_path: bool,
}

impl Address {
    pub fn is_postmaster(&self, primary_mail_host: &str) -> bool {
        self.local_part.eq_ignore_ascii_case("postmaster")
            && (self.domain.is_empty()
                || self.domain.eq_ignore_ascii_case(primary_mail_host))
    }
}

/// Parses the argument of `MAIL FROM:` or `RCPT TO:`, i.e. everything after
/// the colon: `<local@domain> PARAM=value ...` or the bare null path `<>`.
///
/// `allow_null_path` should be `true` only for `MAIL FROM`.
pub fn parse_path(arg: &str, allow_null_path: bool) -> Result<Address, ParseError> {
    let arg = arg.trim();
    if arg.len() > MAX_PATH_LEN {
        return Err(ParseError::PathTooLong);
    }

    let (path_part, params_part) = split_path_and_params(arg);

    let path_part = path_part.trim();
    let inner = path_part
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or(ParseError::Malformed)?;

    if inner.is_empty() {
        if !allow_null_path {
            return Err(ParseError::Malformed);
        }
        return Ok(Address {
            null_path: true,
            ..Default::default()
        });
    }

    let (adl, mailbox) = split_source_route(inner);

    let at_pos = mailbox.rfind('@').ok_or(ParseError::Malformed)?;
    let local_part = &mailbox[..at_pos];
    let domain = &mailbox[at_pos + 1..];

    if local_part.is_empty() || domain.is_empty() {
        return Err(ParseError::Malformed);
    }
    if local_part.len() > MAX_LOCAL_PART_LEN {
        return Err(ParseError::LocalPartTooLong);
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(ParseError::DomainTooLong);
    }

    Ok(Address {
        local_part: local_part.to_string(),
        domain: domain.to_string(),
        adl: adl.to_string(),
        params: parse_params(params_part),
        null_path: false,
    })
}

/// Splits `<path> PARAM=val PARAM2=val2` into `("<path>", "PARAM=val PARAM2=val2")`.
fn split_path_and_params(arg: &str) -> (&str, &str) {
    match arg.find('>') {
        Some(idx) => {
            let (path, rest) = arg.split_at(idx + 1);
            (path, rest.trim())
        }
        None => (arg, ""),
    }
}

/// Strips an RFC-5321 source route prefix (`@a,@b:`) from a mailbox, if present.
fn split_source_route(inner: &str) -> (&str, &str) {
    if inner.starts_with('@') {
        if let Some(colon) = inner.find(':') {
            return (&inner[..colon + 1], &inner[colon + 1..]);
        }
    }
    ("", inner)
}

fn parse_params(params_part: &str) -> Vec<(String, String)> {
    params_part
        .split_whitespace()
        .filter_map(|tok| {
            let mut parts = tok.splitn(2, '=');
            let key = parts.next()?.to_string();
            let value = parts.next().unwrap_or("").to_string();
            Some((key, value))
        })
        .collect()
}

/// Trims surrounding space from a HELO/EHLO argument.
pub fn trim_domain_arg(arg: &str) -> &str {
    arg.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_mailbox() {
        let addr = parse_path("<a@example.com>", false).unwrap();
        assert_eq!(addr.local_part, "a");
        assert_eq!(addr.domain, "example.com");
        assert!(!addr.null_path);
    }

    #[test]
    fn parses_null_path_only_when_allowed() {
        let addr = parse_path("<>", true).unwrap();
        assert!(addr.null_path);
        assert!(parse_path("<>", false).is_err());
    }

    #[test]
    fn parses_params() {
        let addr = parse_path("<a@example.com> SIZE=1024 BODY=8BITMIME", false).unwrap();
        assert_eq!(
            addr.params,
            vec![
                ("SIZE".to_string(), "1024".to_string()),
                ("BODY".to_string(), "8BITMIME".to_string())
            ]
        );
    }

    #[test]
    fn rejects_missing_angle_brackets() {
        assert!(parse_path("a@example.com", false).is_err());
    }

    #[test]
    fn rejects_missing_at_sign() {
        assert!(parse_path("<not-an-address>", false).is_err());
    }

    #[test]
    fn enforces_local_part_limit() {
        let local = "a".repeat(65);
        let addr = format!("<{local}@example.com>");
        assert_eq!(
            parse_path(&addr, false).unwrap_err(),
            ParseError::LocalPartTooLong
        );
    }

    #[test]
    fn enforces_domain_limit() {
        let domain = "a".repeat(256);
        let addr = format!("<a@{domain}>");
        assert_eq!(
            parse_path(&addr, false).unwrap_err(),
            ParseError::DomainTooLong
        );
    }

    #[test]
    fn enforces_overall_path_limit() {
        let local = "a".repeat(64);
        let domain = "b".repeat(190);
        let addr = format!("<{local}@{domain}>");
        assert!(addr.len() > MAX_PATH_LEN);
        assert_eq!(
            parse_path(&addr, false).unwrap_err(),
            ParseError::PathTooLong
        );
    }

    #[test]
    fn strips_source_route() {
        let addr = parse_path("<@hosta,@hostb:user@example.com>", false).unwrap();
        assert_eq!(addr.local_part, "user");
        assert_eq!(addr.domain, "example.com");
        assert_eq!(addr.adl, "@hosta,@hostb:");
    }

    #[test]
    fn postmaster_without_domain_matches() {
        let addr = Address {
            local_part: "Postmaster".to_string(),
            domain: String::new(),
            ..Default::default()
        };
        assert!(addr.is_postmaster("mail.example.com"));
    }
}
