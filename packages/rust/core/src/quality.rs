//! Lead quality score.

use leadharvest_shared::{QualityConfig, Record};

/// Sum of the configured weights for the fields a record carries, capped at 100.
pub fn score(record: &Record, weights: &QualityConfig) -> u32 {
    let has = |field: &Option<leadharvest_shared::ContactField>| {
        field.as_ref().is_some_and(|f| f.is_resolved())
    };

    let mut total = 0;
    if has(&record.email) {
        total += weights.email_weight;
    }
    if has(&record.phone) {
        total += weights.phone_weight;
    }
    if !record.organization.trim().is_empty() {
        total += weights.organization_weight;
    }
    if !record.city.trim().is_empty() {
        total += weights.city_weight;
    }
    total.min(100)
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use leadharvest_shared::{ContactField, Provenance, RawRecord, RecordStatus};

    use super::*;

    fn record() -> Record {
        Record::from_raw(
            RawRecord {
                external_id: "X1".into(),
                first_name: "Jane".into(),
                middle_name: String::new(),
                last_name: "Smith".into(),
                aka: None,
                organization: "RE/MAX River City".into(),
                city: "Calgary".into(),
                sector: None,
                status: RecordStatus::Licensed,
            },
            Utc::now(),
        )
    }

    #[test]
    fn organization_and_city_only() {
        assert_eq!(score(&record(), &QualityConfig::default()), 30);
    }

    #[test]
    fn full_record_scores_100() {
        let mut r = record();
        let now = Utc::now();
        r.email = Some(ContactField::resolved("jane@remax.ca", Provenance::Guess, None, 0.3, now));
        r.phone = Some(ContactField::resolved(
            "(403) 555-0142",
            Provenance::Direct,
            Some("directory_detail"),
            0.8,
            now,
        ));
        assert_eq!(score(&r, &QualityConfig::default()), 100);
    }

    #[test]
    fn unresolved_email_does_not_count() {
        let mut r = record();
        r.email = Some(ContactField::not_found(Utc::now()));
        r.city = String::new();
        assert_eq!(score(&r, &QualityConfig::default()), 20);
    }

    #[test]
    fn capped_at_100() {
        let weights = QualityConfig {
            email_weight: 90,
            phone_weight: 90,
            organization_weight: 90,
            city_weight: 90,
        };
        assert_eq!(score(&record(), &weights), 100);
    }
}
