//! Email and phone extraction from raw HTML.

use std::sync::LazyLock;

use regex::Regex;

static MAILTO_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)mailto:([\w.+-]+@[\w-]+(?:\.[\w-]+)*\.[a-z]{2,})").expect("valid regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\w.+-]+@[\w-]+(?:\.[\w-]+)*\.[a-z]{2,}").expect("valid regex")
});

static STRICT_EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9][a-z0-9._+-]*@[a-z0-9-]+(?:\.[a-z0-9-]+)*\.[a-z]{2,}$")
        .expect("valid regex")
});

/// Phone layouts in priority order; all normalize to `(NNN) NNN-NNNN`.
static PHONE_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\((\d{3})\)\s*(\d{3})[-.\s]\s*(\d{4})",
        r"\b(\d{3})[-.]\s*(\d{3})[-.]\s*(\d{4})\b",
        r"\b(\d{3})[\s.](\d{3})[\s.](\d{4})\b",
        r"\b(\d{3})(\d{3})(\d{4})\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Asset suffixes that the loose address regex picks up from `srcset` etc.
const ASSET_SUFFIXES: &[&str] = &[".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp", ".css", ".js"];

/// All plausible addresses in document order, lower-cased and deduplicated.
/// `mailto:` targets come first.
pub fn find_emails(html: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mailto = MAILTO_RE.captures_iter(html).filter_map(|c| c.get(1));
    let loose = EMAIL_RE.find_iter(html);

    for m in mailto.map(|m| m.as_str()).chain(loose.map(|m| m.as_str())) {
        let email = m.trim_matches('.').to_lowercase();
        if !is_valid_email(&email) || out.contains(&email) {
            continue;
        }
        out.push(email);
    }
    out
}

/// The first address on the page (`mailto:` preferred).
pub fn extract_email(html: &str) -> Option<String> {
    find_emails(html).into_iter().next()
}

/// The first phone number on the page, normalized to `(NNN) NNN-NNNN`.
pub fn extract_phone(html: &str) -> Option<String> {
    PHONE_RES.iter().find_map(|re| {
        re.captures(html)
            .map(|c| format!("({}) {}-{}", &c[1], &c[2], &c[3]))
    })
}

/// Syntactic address check.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.to_ascii_lowercase();
    if !STRICT_EMAIL_RE.is_match(&email) {
        return false;
    }
    if ASSET_SUFFIXES.iter().any(|s| email.ends_with(s)) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.contains("..") && !domain.contains("..") && !local.ends_with('.')
}

/// Split an address into `(local, domain)`.
pub fn split_email(email: &str) -> Option<(&str, &str)> {
    email.split_once('@').filter(|(l, d)| !l.is_empty() && !d.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailto_is_preferred() {
        let html = r#"<p>Office: office@acme.ca</p><a href="mailto:Jane.Doe@acme.ca">Email</a>"#;
        assert_eq!(extract_email(html).as_deref(), Some("jane.doe@acme.ca"));
        assert_eq!(
            find_emails(html),
            vec!["jane.doe@acme.ca".to_string(), "office@acme.ca".to_string()]
        );
    }

    #[test]
    fn falls_back_to_loose_match() {
        let html = "<td>Contact: jdoe@realty-one.com</td>";
        assert_eq!(extract_email(html).as_deref(), Some("jdoe@realty-one.com"));
    }

    #[test]
    fn ignores_asset_names() {
        let html = r#"<img srcset="logo@2x.png 2x">"#;
        assert!(find_emails(html).is_empty());
    }

    #[test]
    fn phone_formats_normalize() {
        assert_eq!(
            extract_phone("Phone: (403) 555-1234").as_deref(),
            Some("(403) 555-1234")
        );
        assert_eq!(
            extract_phone("Cell 403-555-1234").as_deref(),
            Some("(403) 555-1234")
        );
        assert_eq!(
            extract_phone("tel 403.555.1234").as_deref(),
            Some("(403) 555-1234")
        );
        assert_eq!(
            extract_phone("call 403 555 1234 today").as_deref(),
            Some("(403) 555-1234")
        );
        assert_eq!(
            extract_phone("raw 4035551234").as_deref(),
            Some("(403) 555-1234")
        );
        assert_eq!(extract_phone("no digits here"), None);
    }

    #[test]
    fn email_validation() {
        assert!(is_valid_email("jane.doe@acme.ca"));
        assert!(is_valid_email("j+tag@sub.acme.com"));
        assert!(!is_valid_email("jane..doe@acme.ca"));
        assert!(!is_valid_email("jane@acme"));
        assert!(!is_valid_email("@acme.ca"));
        assert!(!is_valid_email("not an email"));
    }

    #[test]
    fn split_email_parts() {
        assert_eq!(split_email("a@b.ca"), Some(("a", "b.ca")));
        assert_eq!(split_email("nope"), None);
    }
}
