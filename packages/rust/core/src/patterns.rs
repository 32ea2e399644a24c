//! Email local-part templates and per-organization pattern learning.
//!
//! Templates use `{first}`, `{last}`, `{f}` (first initial) and `{l}` (last
//! initial) over normalized names: lowercase ASCII alphanumerics, first name
//! reduced to its first word.

use chrono::{DateTime, Utc};
use tracing::debug;

use leadharvest_fetcher::contact::split_email;
use leadharvest_shared::{EnrichmentConfig, Pattern, PatternStore, Record, Result};

/// Templates recognized when deriving a pattern, most specific first.
pub const KNOWN_TEMPLATES: &[&str] = &[
    "{first}.{last}",
    "{first}{last}",
    "{f}{last}",
    "{first}.{l}",
    "{first}{l}",
    "{first}_{last}",
    "{last}{first}",
    "{first}",
    "{last}",
    "{last}{f}",
];

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

/// Lowercase ASCII alphanumerics only.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Normalized (first, last) for a record.
pub fn person_names(record: &Record) -> (String, String) {
    let first = record.first_name.split_whitespace().next().unwrap_or_default();
    (normalize_name(first), normalize_name(&record.last_name))
}

/// Render `template` for the given normalized names.
///
/// Returns `None` when the template references a name that is empty.
pub fn render(template: &str, first: &str, last: &str) -> Option<String> {
    let needs_first = template.contains("{first}") || template.contains("{f}");
    let needs_last = template.contains("{last}") || template.contains("{l}");
    if (needs_first && first.is_empty()) || (needs_last && last.is_empty()) {
        return None;
    }

    let initial = |s: &str| s.chars().next().map(String::from).unwrap_or_default();
    let local = template
        .replace("{first}", first)
        .replace("{last}", last)
        .replace("{f}", &initial(first))
        .replace("{l}", &initial(last));
    (!local.is_empty() && !local.contains(['{', '}'])).then_some(local)
}

/// A template recovered from an observed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedTemplate {
    pub template: String,
    /// Inferred rather than one of [`KNOWN_TEMPLATES`].
    pub custom: bool,
}

/// Recover the template that produced `local` for these names.
pub fn derive_template(local: &str, first: &str, last: &str) -> Option<DerivedTemplate> {
    let local = local.to_ascii_lowercase();

    if let Some(known) = KNOWN_TEMPLATES
        .iter()
        .find(|t| render(t, first, last).as_deref() == Some(local.as_str()))
    {
        return Some(DerivedTemplate {
            template: (*known).to_string(),
            custom: false,
        });
    }

    if first.len() < 2 || last.len() < 2 || !local.contains(first) || !local.contains(last) {
        return None;
    }
    let template = if local.find(first) <= local.find(last) {
        local.replacen(first, "{first}", 1).replacen(last, "{last}", 1)
    } else {
        local.replacen(last, "{last}", 1).replacen(first, "{first}", 1)
    };
    (template.contains("{first}") && template.contains("{last}")).then_some(DerivedTemplate {
        template,
        custom: true,
    })
}

/// Whether an address's local part plausibly belongs to this person.
pub fn matches_person(local: &str, first: &str, last: &str) -> bool {
    if derive_template(local, first, last).is_some() {
        return true;
    }
    let local = local.to_ascii_lowercase();
    last.len() >= 3
        && local.contains(last)
        && first.chars().next().is_some_and(|c| local.starts_with(c))
}

// ---------------------------------------------------------------------------
// Learning
// ---------------------------------------------------------------------------

/// Result of feeding one direct extraction to the learner.
#[derive(Debug, Clone, PartialEq)]
pub enum LearnOutcome {
    /// Free-mail domain, or no template explains the address.
    Skipped,
    Created(Pattern),
    Reinforced(Pattern),
    /// A different template is already stored; left untouched.
    Conflicting(Pattern),
}

/// Maintains organization patterns from confirmed addresses.
#[derive(Debug, Clone)]
pub struct PatternLearner {
    config: EnrichmentConfig,
}

impl PatternLearner {
    pub fn new(config: &EnrichmentConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Fold a directly extracted `email` for `record` into the pattern for
    /// `org_key`. `signal` scales the reinforcement step.
    ///
    /// Writes go through insert-if-absent and the store's atomic
    /// reinforcement, so workers sharing a store never overwrite each other.
    pub async fn learn(
        &self,
        store: &dyn PatternStore,
        org_key: &str,
        email: &str,
        record: &Record,
        signal: f64,
        now: DateTime<Utc>,
    ) -> Result<LearnOutcome> {
        let email = email.to_ascii_lowercase();
        let Some((local, domain)) = split_email(&email) else {
            return Ok(LearnOutcome::Skipped);
        };
        if self.config.is_free_mail(domain) {
            debug!(org_key, domain, "free-mail address, not learning");
            return Ok(LearnOutcome::Skipped);
        }

        let (first, last) = person_names(record);
        let Some(derived) = derive_template(local, &first, &last) else {
            debug!(org_key, local, "no template explains address");
            return Ok(LearnOutcome::Skipped);
        };

        let mut stored = store.get_pattern(org_key).await?;
        if stored.is_none() {
            let confidence = if derived.custom {
                self.config.pattern_custom_confidence
            } else {
                self.config.pattern_initial_confidence
            };
            let pattern = Pattern {
                org_key: org_key.to_string(),
                template: derived.template.clone(),
                domain: domain.to_string(),
                confidence: confidence.clamp(0.0, 1.0),
                evidence_count: 1,
                examples: vec![email.clone()],
                created_at: now,
                updated_at: now,
            };
            if store.insert_pattern(&pattern).await? {
                debug!(org_key, template = %pattern.template, "pattern created");
                return Ok(LearnOutcome::Created(pattern));
            }
            debug!(org_key, "pattern created concurrently, reinforcing instead");
            stored = store.get_pattern(org_key).await?;
        }

        let Some(pattern) = stored else {
            return Ok(LearnOutcome::Skipped);
        };
        if pattern.template != derived.template {
            debug!(
                org_key,
                stored = %pattern.template,
                observed = %derived.template,
                "observed template differs from stored pattern"
            );
            return Ok(LearnOutcome::Conflicting(pattern));
        }

        let step = self.config.learning_rate * signal.clamp(0.0, 1.0);
        match store
            .reinforce_pattern(org_key, &derived.template, step, &email, now)
            .await?
        {
            Some(pattern) => {
                debug!(
                    org_key,
                    confidence = pattern.confidence,
                    evidence = pattern.evidence_count,
                    "pattern reinforced"
                );
                Ok(LearnOutcome::Reinforced(pattern))
            }
            None => Ok(LearnOutcome::Conflicting(pattern)),
        }
    }
}
