//! Organization name to canonical domain.

use std::sync::LazyLock;

use regex::Regex;

use leadharvest_shared::EnrichmentConfig;

/// "o/a" (operating as) marker; the brand follows it.
static OPERATING_AS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bo/a\b").expect("valid regex"));

const LEGAL_SUFFIXES: &[&str] = &[
    "inc",
    "ltd",
    "corp",
    "corporation",
    "limited",
    "llc",
    "ulc",
    "llp",
];

/// Derives an organization's email domain from its legal name.
#[derive(Debug, Clone)]
pub struct DomainResolver {
    aliases: Vec<(String, String)>,
    tld: String,
}

impl DomainResolver {
    pub fn new(config: &EnrichmentConfig) -> Self {
        let mut aliases: Vec<(String, String)> = config
            .franchise_aliases
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.to_lowercase()))
            .collect();
        // Longer fragments first so "re/max" beats a shorter overlapping alias.
        aliases.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        Self {
            aliases,
            tld: config.tld.trim_start_matches('.').to_lowercase(),
        }
    }

    /// Canonical domain for `organization`, or `None` when nothing usable
    /// remains after normalization.
    pub fn resolve(&self, organization: &str) -> Option<String> {
        let lowered = organization.trim().to_lowercase();
        let brand = match OPERATING_AS_RE.find(&lowered) {
            Some(m) if !lowered[m.end()..].trim().is_empty() => lowered[m.end()..].trim(),
            Some(m) => lowered[..m.start()].trim(),
            None => lowered.as_str(),
        };
        let name = brand.replace('&', " and ");

        if let Some((_, domain)) = self.aliases.iter().find(|(alias, _)| name.contains(alias.as_str())) {
            return Some(domain.clone());
        }

        // Whole words only: "inc" goes, "income" stays.
        let tokens: Vec<&str> = name
            .split_whitespace()
            .filter(|t| !LEGAL_SUFFIXES.contains(&t.trim_end_matches(['.', ','])))
            .collect();

        let slug: String = tokens
            .concat()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        if slug.is_empty() {
            return None;
        }
        Some(format!("{slug}.{}", self.tld))
    }
}
