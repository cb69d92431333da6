//! Canonical message fingerprints.
//!
//! Variable fragments (timestamps, ids, addresses, numbers, paths) are
//! replaced with class tokens so that semantically equivalent lines map to
//! the same key. Derivation is pure: identical inputs yield byte-identical
//! outputs regardless of wall-clock time. Paths are canonicalized before
//! bare numbers so that `/var/run/app2.sock` survives as one `<PATH>`
//! token instead of a mangled mix.

use once_cell::sync::Lazy;
use regex::Regex;

const MAX_FINGERPRINT_LEN: usize = 200;

static TIMESTAMP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \d{4}-\d{2}-\d{2}[T\ ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?(?:Z|[+-]\d{2}:?\d{2})?
        | [A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}
        | \d{2}/[A-Z][a-z]{2}/\d{4}:\d{2}:\d{2}:\d{2}
        | \b1\d{12}\b
        | \b1\d{9}\b
        | \b\d{2}:\d{2}:\d{2}(?:[.,]\d+)?\b
        ",
    )
    .unwrap()
});

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .unwrap()
});

static IP_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        \b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}(?::\d+)?\b
        | \b(?:[0-9a-fA-F]{1,4}:){2,7}[0-9a-fA-F]{1,4}\b
        ",
    )
    .unwrap()
});

static PATH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:[A-Za-z]:)?(?:/[\w.\-+]+){2,}/?"#).unwrap()
});

static HEX_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:0x)?[0-9a-fA-F]{6,}\b").unwrap());

// Digit runs are replaced wherever they appear, including with attached
// units ("30s", "1.5ms"); a trailing \b would leave those varying.
static FLOAT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d+").unwrap());

static INT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Derive the canonical fingerprint of a message portion.
pub fn fingerprint(message: &str) -> String {
    let mut s = TIMESTAMP_RE.replace_all(message, "<T>").into_owned();
    s = UUID_RE.replace_all(&s, "<UUID>").into_owned();
    s = IP_RE.replace_all(&s, "<IP>").into_owned();
    s = PATH_RE.replace_all(&s, "<PATH>").into_owned();
    // All-letter hex words ("decade") stay; a run must carry a digit or an
    // 0x prefix to count as an identifier.
    s = HEX_RE
        .replace_all(&s, |caps: &regex::Captures<'_>| {
            let m = &caps[0];
            if m.starts_with("0x") || m.bytes().any(|b| b.is_ascii_digit()) {
                "<HEX>".to_string()
            } else {
                m.to_string()
            }
        })
        .into_owned();
    s = FLOAT_RE.replace_all(&s, "<F>").into_owned();
    s = INT_RE.replace_all(&s, "<N>").into_owned();
    let s = WS_RE.replace_all(&s, " ");
    let s = s.trim();

    if s.chars().count() > MAX_FINGERPRINT_LEN {
        s.chars().take(MAX_FINGERPRINT_LEN).collect()
    } else {
        s.to_string()
    }
}
