//! Tiered contact enrichment.
//!
//! Resolution order for a record's email:
//! 1. direct sources ([`ContactSource`]), first hit wins and feeds the
//!    pattern learner;
//! 2. the organization's learned [`Pattern`], when confident enough;
//! 3. configured guess templates against the resolved domain.
//!
//! A miss on every tier is a value ([`Provenance::NotFound`]), not an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use url::Url;

use leadharvest_fetcher::contact::{find_emails, is_valid_email, split_email};
use leadharvest_fetcher::http::{build_client, is_ssrf_target, network_error, read_body};
use leadharvest_fetcher::{DetailSource, Fetcher};
use leadharvest_shared::{
    ContactField, EnrichmentConfig, FetchConfig, HarvestError, Pattern, PatternStore, Provenance,
    QualityConfig, Record, Result,
};

use crate::domain::DomainResolver;
use crate::patterns::{PatternLearner, matches_person, person_names, render};
use crate::quality;

pub const METHOD_DIRECTORY_DETAIL: &str = "directory_detail";
pub const METHOD_ORGANIZATION_SITE: &str = "organization_site";
pub const METHOD_LEARNED_PATTERN: &str = "learned_pattern";
pub const METHOD_GUESS: &str = "guess";

// ---------------------------------------------------------------------------
// Direct sources
// ---------------------------------------------------------------------------

/// Contact details found by a direct source.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectContact {
    pub email: Option<String>,
    pub phone: Option<String>,
    pub confidence: f64,
    pub method: String,
}

/// A tier-1 source that extracts contact details for one record.
#[async_trait]
pub trait ContactSource: Send + Sync {
    fn name(&self) -> &str;

    /// Look up `record`. `domain` is the resolved organization domain, if any.
    async fn lookup(&self, record: &Record, domain: Option<&str>) -> Result<Option<DirectContact>>;
}

/// The directory's own drill-through detail view.
pub struct DirectoryDetailSource<S: ?Sized> {
    fetcher: Arc<Fetcher<S>>,
    confidence: f64,
}

impl<S: DetailSource + ?Sized> DirectoryDetailSource<S> {
    pub fn new(fetcher: Arc<Fetcher<S>>, config: &EnrichmentConfig) -> Self {
        Self {
            fetcher,
            confidence: config.directory_confidence,
        }
    }
}

#[async_trait]
impl<S: DetailSource + ?Sized + 'static> ContactSource for DirectoryDetailSource<S> {
    fn name(&self) -> &str {
        METHOD_DIRECTORY_DETAIL
    }

    async fn lookup(&self, record: &Record, _domain: Option<&str>) -> Result<Option<DirectContact>> {
        let detail = self.fetcher.fetch_detail(&record.external_id).await?;
        Ok(detail.map(|d| DirectContact {
            email: d.email,
            phone: d.phone,
            confidence: self.confidence,
            method: METHOD_DIRECTORY_DETAIL.to_string(),
        }))
    }
}

/// Probes a handful of pages on the organization's website for an address
/// whose local part matches the person's name.
pub struct OrganizationSiteSource {
    client: Client,
    paths: Vec<String>,
    confidence: f64,
    min_delay: Duration,
    next_allowed: Mutex<HashMap<String, Instant>>,
    base: Option<Url>,
    allow_private: bool,
}

impl OrganizationSiteSource {
    pub fn new(config: &EnrichmentConfig, fetch: &FetchConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(&fetch.user_agent, fetch.timeout(), false)?,
            paths: config.site_paths.clone(),
            confidence: config.site_confidence,
            min_delay: config.site_min_delay(),
            next_allowed: Mutex::new(HashMap::new()),
            base: None,
            allow_private: false,
        })
    }

    /// Serve every domain from `base` (a local mock server).
    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base: Url) -> Self {
        self.base = Some(base);
        self.allow_private = true;
        self
    }

    /// Reserve the next request slot for `domain` and wait for it.
    async fn pace(&self, domain: &str) {
        let wait = {
            let mut slots = self.next_allowed.lock().await;
            let now = Instant::now();
            let slot = slots.get(domain).copied().filter(|t| *t > now).unwrap_or(now);
            slots.insert(domain.to_string(), slot + self.min_delay);
            slot - now
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn page_url(&self, domain: &str, path: &str) -> Result<Url> {
        let base = match &self.base {
            Some(base) => base.clone(),
            None => Url::parse(&format!("https://{domain}/"))
                .map_err(|e| HarvestError::validation(format!("bad organization domain {domain}: {e}")))?,
        };
        base.join(path)
            .map_err(|e| HarvestError::validation(format!("bad site path {path}: {e}")))
    }

    async fn fetch(&self, url: &Url) -> Result<String> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| network_error(url.as_str(), e))?;
        read_body(url.as_str(), response).await
    }
}

#[async_trait]
impl ContactSource for OrganizationSiteSource {
    fn name(&self) -> &str {
        METHOD_ORGANIZATION_SITE
    }

    async fn lookup(&self, record: &Record, domain: Option<&str>) -> Result<Option<DirectContact>> {
        let Some(domain) = domain else {
            return Ok(None);
        };
        let (first, last) = person_names(record);

        for path in &self.paths {
            let url = self.page_url(domain, path)?;
            if !self.allow_private && is_ssrf_target(&url) {
                warn!(%url, "refusing to fetch private address");
                return Ok(None);
            }

            self.pace(domain).await;
            let body = match self.fetch(&url).await {
                Ok(body) => body,
                Err(e) => {
                    debug!(%url, error = %e, "site page unavailable");
                    continue;
                }
            };

            let hit = find_emails(&body).into_iter().find(|email| {
                split_email(email).is_some_and(|(local, _)| matches_person(local, &first, &last))
            });
            if let Some(email) = hit {
                debug!(%url, %email, "name-matched address on organization site");
                return Ok(Some(DirectContact {
                    email: Some(email),
                    phone: None,
                    confidence: self.confidence,
                    method: METHOD_ORGANIZATION_SITE.to_string(),
                }));
            }
        }
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Enrichment cache
// ---------------------------------------------------------------------------

/// Resolved contact fields for one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub email: ContactField,
    /// Set only when a direct source reported a phone number.
    pub phone: Option<ContactField>,
    pub domain: Option<String>,
}

/// Tiered email resolution with pattern learning.
pub struct EnrichmentCache {
    sources: Vec<Arc<dyn ContactSource>>,
    patterns: Arc<dyn PatternStore>,
    resolver: DomainResolver,
    learner: PatternLearner,
    config: EnrichmentConfig,
    weights: QualityConfig,
}

impl EnrichmentCache {
    pub fn new(
        config: &EnrichmentConfig,
        weights: &QualityConfig,
        patterns: Arc<dyn PatternStore>,
    ) -> Self {
        Self {
            sources: Vec::new(),
            patterns,
            resolver: DomainResolver::new(config),
            learner: PatternLearner::new(config),
            config: config.clone(),
            weights: weights.clone(),
        }
    }

    /// Append a direct source; sources are tried in insertion order.
    pub fn with_source(mut self, source: Arc<dyn ContactSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn resolver(&self) -> &DomainResolver {
        &self.resolver
    }

    /// Resolve contact fields for `record` without modifying it.
    #[instrument(skip_all, fields(id = %record.external_id))]
    pub async fn resolve(&self, record: &Record, now: DateTime<Utc>) -> Result<Resolution> {
        let domain = self.resolver.resolve(&record.organization);
        let mut phone = None;

        for source in &self.sources {
            let contact = match source.lookup(record, domain.as_deref()).await {
                Ok(Some(contact)) => contact,
                Ok(None) => continue,
                Err(e) => {
                    warn!(source = source.name(), error = %e, "contact source failed, treating as miss");
                    continue;
                }
            };

            if phone.is_none() {
                phone = contact.phone.as_ref().map(|p| {
                    ContactField::resolved(
                        p,
                        Provenance::Direct,
                        Some(contact.method.as_str()),
                        contact.confidence,
                        now,
                    )
                });
            }
            let Some(email) = contact.email.filter(|e| is_valid_email(e)) else {
                continue;
            };
            let email = email.to_ascii_lowercase();

            let org_key = domain
                .clone()
                .or_else(|| split_email(&email).map(|(_, d)| d.to_string()));
            if let Some(org_key) = org_key {
                self.learner
                    .learn(self.patterns.as_ref(), &org_key, &email, record, contact.confidence, now)
                    .await?;
            }

            debug!(source = source.name(), "direct hit");
            return Ok(Resolution {
                email: ContactField::resolved(
                    email,
                    Provenance::Direct,
                    Some(contact.method.as_str()),
                    contact.confidence,
                    now,
                ),
                phone,
                domain,
            });
        }

        let Some(domain) = domain else {
            debug!("no domain for organization, unresolved");
            return Ok(Resolution {
                email: ContactField::not_found(now),
                phone,
                domain: None,
            });
        };

        let (first, last) = person_names(record);

        if let Some(pattern) = self.patterns.get_pattern(&domain).await? {
            if let Some(email) = self.apply_pattern(&pattern, &first, &last) {
                debug!(template = %pattern.template, "pattern hit");
                return Ok(Resolution {
                    email: ContactField::resolved(
                        email,
                        Provenance::Pattern,
                        Some(METHOD_LEARNED_PATTERN),
                        pattern.confidence * self.config.pattern_scale,
                        now,
                    ),
                    phone,
                    domain: Some(domain),
                });
            }
        }

        let guess = self
            .config
            .guess_templates
            .iter()
            .filter_map(|t| render(t, &first, &last))
            .map(|local| format!("{local}@{domain}"))
            .find(|email| is_valid_email(email));

        let email = match guess {
            Some(email) => ContactField::resolved(
                email,
                Provenance::Guess,
                Some(METHOD_GUESS),
                self.config.guess_confidence,
                now,
            ),
            None => ContactField::not_found(now),
        };
        Ok(Resolution {
            email,
            phone,
            domain: Some(domain),
        })
    }

    fn apply_pattern(&self, pattern: &Pattern, first: &str, last: &str) -> Option<String> {
        if pattern.confidence <= self.config.pattern_min_confidence {
            return None;
        }
        let email = format!("{}@{}", render(&pattern.template, first, last)?, pattern.domain);
        is_valid_email(&email).then_some(email)
    }

    /// Resolve and write the result into `record`, recomputing its quality
    /// score. A phone is only replaced when a direct source reported one.
    pub async fn enrich(&self, record: &mut Record, now: DateTime<Utc>) -> Result<Provenance> {
        let resolution = self.resolve(record, now).await?;
        let provenance = resolution.email.provenance;
        record.email = Some(resolution.email);
        if let Some(phone) = resolution.phone {
            record.phone = Some(phone);
        }
        record.quality_score = quality::score(record, &self.weights);
        Ok(provenance)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use leadharvest_fetcher::{DetailContact, RetryPolicy};
    use leadharvest_shared::{RawRecord, RecordStatus};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::patterns::tests::MemoryPatterns;

    fn person(id: &str, first: &str, last: &str, organization: &str) -> Record {
        Record::from_raw(
            RawRecord {
                external_id: id.into(),
                first_name: first.into(),
                middle_name: String::new(),
                last_name: last.into(),
                aka: None,
                organization: organization.into(),
                city: "Calgary".into(),
                sector: None,
                status: RecordStatus::Licensed,
            },
            Utc::now(),
        )
    }

    /// Source returning a fixed answer (or error) and counting calls.
    struct StubSource {
        answer: Option<DirectContact>,
        fail: bool,
        calls: AtomicU32,
    }

    impl StubSource {
        fn hit(email: &str, confidence: f64) -> Arc<Self> {
            Arc::new(Self {
                answer: Some(DirectContact {
                    email: Some(email.into()),
                    phone: Some("(403) 555-0142".into()),
                    confidence,
                    method: "stub".into(),
                }),
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn miss() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                fail: false,
                calls: AtomicU32::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                answer: None,
                fail: true,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ContactSource for StubSource {
        fn name(&self) -> &str {
            "stub"
        }

        async fn lookup(&self, _record: &Record, _domain: Option<&str>) -> Result<Option<DirectContact>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HarvestError::Network("connection reset".into()));
            }
            Ok(self.answer.clone())
        }
    }

    fn seeded_pattern(confidence: f64) -> Arc<MemoryPatterns> {
        let store = MemoryPatterns::default();
        let now = Utc::now();
        store.patterns.lock().unwrap().insert(
            "remax.ca".into(),
            Pattern {
                org_key: "remax.ca".into(),
                template: "{f}{last}".into(),
                domain: "remax.ca".into(),
                confidence,
                evidence_count: 3,
                examples: vec![],
                created_at: now,
                updated_at: now,
            },
        );
        Arc::new(store)
    }

    fn cache(patterns: Arc<MemoryPatterns>) -> EnrichmentCache {
        EnrichmentCache::new(&EnrichmentConfig::default(), &QualityConfig::default(), patterns)
    }

    #[tokio::test]
    async fn direct_hit_wins_over_pattern() {
        let first = StubSource::hit("Jane.Smith@remax.ca", 0.8);
        let second = StubSource::hit("other@remax.ca", 1.0);
        let cache = cache(seeded_pattern(0.95))
            .with_source(first.clone())
            .with_source(second.clone());

        let record = person("X1", "Jane", "Smith", "RE/MAX River City");
        let res = cache.resolve(&record, Utc::now()).await.unwrap();

        assert_eq!(res.email.provenance, Provenance::Direct);
        assert_eq!(res.email.value.as_deref(), Some("jane.smith@remax.ca"));
        assert_eq!(res.email.method.as_deref(), Some("stub"));
        assert!((res.email.confidence - 0.8).abs() < 1e-9);
        assert_eq!(res.phone.unwrap().value.as_deref(), Some("(403) 555-0142"));
        assert_eq!(res.domain.as_deref(), Some("remax.ca"));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_source_is_a_miss() {
        let failing = StubSource::failing();
        let cache = cache(seeded_pattern(0.8)).with_source(failing.clone());

        let record = person("X1", "Jane", "Smith", "RE/MAX River City");
        let res = cache.resolve(&record, Utc::now()).await.unwrap();

        assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
        assert_eq!(res.email.provenance, Provenance::Pattern);
        assert_eq!(res.email.value.as_deref(), Some("jsmith@remax.ca"));
        assert!((res.email.confidence - 0.72).abs() < 1e-9);
        assert!(res.phone.is_none());
    }

    #[tokio::test]
    async fn pattern_at_threshold_is_not_applied() {
        let cache = cache(seeded_pattern(0.5)).with_source(StubSource::miss());
        let record = person("X1", "Jane", "Smith", "RE/MAX River City");
        let res = cache.resolve(&record, Utc::now()).await.unwrap();

        assert_eq!(res.email.provenance, Provenance::Guess);
        assert_eq!(res.email.value.as_deref(), Some("jane@remax.ca"));
        assert!((res.email.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn no_domain_is_not_found() {
        let cache = cache(Arc::new(MemoryPatterns::default()));
        let record = person("X1", "Jane", "Smith", "  ");
        let res = cache.resolve(&record, Utc::now()).await.unwrap();

        assert_eq!(res.email.provenance, Provenance::NotFound);
        assert_eq!(res.email.value, None);
        assert_eq!(res.email.confidence, 0.0);
        assert_eq!(res.domain, None);
    }

    #[tokio::test]
    async fn direct_hits_teach_later_lookups() {
        let patterns = Arc::new(MemoryPatterns::default());
        let seeded = cache(patterns.clone()).with_source(StubSource::hit("jane.smith@remax.ca", 1.0));
        seeded
            .resolve(&person("X1", "Jane", "Smith", "RE/MAX River City"), Utc::now())
            .await
            .unwrap();

        let stored = patterns.get_pattern("remax.ca").await.unwrap().unwrap();
        assert_eq!(stored.template, "{first}.{last}");
        assert!((stored.confidence - 0.7).abs() < 1e-9);

        let learner = cache(patterns);
        let res = learner
            .resolve(&person("X2", "John", "Doe", "RE/MAX Real Estate Central"), Utc::now())
            .await
            .unwrap();
        assert_eq!(res.email.provenance, Provenance::Pattern);
        assert_eq!(res.email.value.as_deref(), Some("john.doe@remax.ca"));
        assert!((res.email.confidence - 0.63).abs() < 1e-9);
    }

    #[tokio::test]
    async fn enrich_sets_fields_and_quality() {
        let cache = cache(Arc::new(MemoryPatterns::default()))
            .with_source(StubSource::hit("jane.smith@remax.ca", 0.8));
        let mut record = person("X1", "Jane", "Smith", "RE/MAX River City");

        let provenance = cache.enrich(&mut record, Utc::now()).await.unwrap();
        assert_eq!(provenance, Provenance::Direct);
        assert!(record.email.as_ref().unwrap().is_resolved());
        assert!(record.phone.is_some());
        assert_eq!(record.quality_score, 100);
    }

    struct FixedDetail(Option<DetailContact>);

    #[async_trait]
    impl DetailSource for FixedDetail {
        async fn fetch_detail(&self, _id: &str) -> Result<Option<DetailContact>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn directory_detail_source_maps_contact() {
        let detail = FixedDetail(Some(DetailContact {
            email: Some("jane.smith@remax.ca".into()),
            phone: Some("(403) 555-0142".into()),
        }));
        let fetcher = Arc::new(Fetcher::new(
            Arc::new(detail),
            Duration::ZERO,
            RetryPolicy::immediate(1),
        ));
        let source = DirectoryDetailSource::new(fetcher, &EnrichmentConfig::default());

        let record = person("X1", "Jane", "Smith", "RE/MAX River City");
        let contact = source.lookup(&record, None).await.unwrap().unwrap();
        assert_eq!(contact.method, METHOD_DIRECTORY_DETAIL);
        assert!((contact.confidence - 0.8).abs() < 1e-9);
        assert_eq!(contact.email.as_deref(), Some("jane.smith@remax.ca"));
    }

    fn site_source(server: &MockServer) -> OrganizationSiteSource {
        let mut config = EnrichmentConfig::default();
        config.site_min_delay_ms = 0;
        OrganizationSiteSource::new(&config, &FetchConfig::default())
            .unwrap()
            .with_base_url(Url::parse(&server.uri()).unwrap())
    }

    #[tokio::test]
    async fn site_source_accepts_name_matched_address_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<footer><a href="mailto:info@riverrealty.ca">info@riverrealty.ca</a></footer>"#,
            ))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/contact"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/agents"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<ul><li>Bob Jones: bjones@riverrealty.ca</li>
                   <li>Jane Smith: <a href="mailto:Jane.Smith@RiverRealty.ca">email</a></li></ul>"#,
            ))
            .mount(&server)
            .await;

        let source = site_source(&server);
        let record = person("X1", "Jane", "Smith", "River Realty Ltd.");
        let contact = source
            .lookup(&record, Some("riverrealty.ca"))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(contact.email.as_deref(), Some("jane.smith@riverrealty.ca"));
        assert_eq!(contact.method, METHOD_ORGANIZATION_SITE);
        assert_eq!(contact.confidence, 1.0);
    }

    #[tokio::test]
    async fn site_source_misses_without_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<p>office@riverrealty.ca</p>"))
            .mount(&server)
            .await;

        let source = site_source(&server);
        let record = person("X1", "Jane", "Smith", "River Realty Ltd.");
        assert!(source.lookup(&record, Some("riverrealty.ca")).await.unwrap().is_none());
        assert!(source.lookup(&record, None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn site_source_refuses_private_hosts() {
        let source = OrganizationSiteSource::new(&EnrichmentConfig::default(), &FetchConfig::default())
            .unwrap();
        let record = person("X1", "Jane", "Smith", "Local");
        assert!(source.lookup(&record, Some("localhost")).await.unwrap().is_none());
    }
}
