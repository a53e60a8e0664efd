use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static OAI_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"oai:(.+):(.+)").expect("valid OAI identifier regex"));
static DOI_REFERENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(doi|DOI):\s?\S+").expect("valid DOI regex"));
static DOI_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(doi|DOI):\s?").expect("valid DOI prefix regex"));
static EMBEDDED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(http|ftp|https)://([\w_-]+(?:(?:\.[\w_-]+)+))([\w.,@?^=%&:/~+#-]*[\w@?^=%&/~+#-])?")
        .expect("valid embedded URL regex")
});

/// Stable record identity: the same item URL always maps to the same id.
pub fn record_uuid(item_url: &str) -> Option<Uuid> {
    let item_url = item_url.trim();
    if item_url.is_empty() {
        return None;
    }
    Some(Uuid::new_v5(&Uuid::NAMESPACE_URL, item_url.as_bytes()))
}

fn is_http(value: &str) -> bool {
    value.starts_with("http") || value.starts_with("HTTP")
}

/// Derive the landing-page URL of a record from whatever the source handed us.
///
/// Tried in order: identifier that is already a link, OAI id substituted into
/// the repository `%id%` pattern, the pattern with the full identifier, a DOI,
/// an HTTP source URL, and finally any URL embedded in the identifier.
pub fn resolve_item_url(
    identifier: &str,
    item_url_pattern: Option<&str>,
    source_url: Option<&str>,
) -> Option<String> {
    if is_http(identifier) {
        return Some(identifier.to_string());
    }

    let oai_id = OAI_IDENTIFIER
        .captures(identifier)
        .and_then(|caps| caps.get(2))
        .map(|id| id.as_str().replace('_', ":"));

    if let Some(pattern) = item_url_pattern.filter(|p| !p.is_empty()) {
        let id = oai_id.as_deref().unwrap_or(identifier);
        return Some(pattern.replace("%id%", id));
    }

    if let Some(doi) = DOI_REFERENCE.find(identifier) {
        let doi = doi.as_str().trim_end_matches('.');
        return Some(DOI_PREFIX.replace(doi, "https://doi.org/").into_owned());
    }

    if let Some(source_url) = source_url.filter(|s| is_http(s)) {
        return Some(source_url.to_string());
    }

    EMBEDDED_URL
        .find(identifier)
        .map(|found| found.as_str().to_string())
}

/// Accepts `YYYY`, `YYYY-MM` or `YYYY-MM-DD`, optionally followed by a time part.
pub fn normalize_pub_date(raw: &str) -> Option<String> {
    let date_part = raw.trim().split(['T', ' ']).next()?;
    let mut parts = date_part.split('-');

    let year_text = parts.next()?;
    if year_text.len() != 4 || !year_text.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let year: i32 = year_text.parse().ok()?;

    match (parts.next(), parts.next(), parts.next()) {
        (None, None, None) => Some(format!("{year:04}")),
        (Some(month), None, None) => {
            let month: u32 = month.parse().ok()?;
            NaiveDate::from_ymd_opt(year, month, 1)?;
            Some(format!("{year:04}-{month:02}"))
        }
        (Some(month), Some(day), None) => {
            let date = NaiveDate::from_ymd_opt(year, month.parse().ok()?, day.parse().ok()?)?;
            Some(date.format("%Y-%m-%d").to_string())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_deterministic_per_url() {
        let a = record_uuid("https://data.example.org/dataset/1").unwrap();
        let b = record_uuid("https://data.example.org/dataset/1").unwrap();
        let c = record_uuid("https://data.example.org/dataset/2").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.get_version_num(), 5);
        assert_eq!(record_uuid("  "), None);
    }

    #[test]
    fn identifier_that_is_a_link_wins() {
        assert_eq!(
            resolve_item_url("https://example.org/x", Some("https://other/%id%"), None).as_deref(),
            Some("https://example.org/x")
        );
    }

    #[test]
    fn oai_identifier_is_substituted_into_pattern() {
        assert_eq!(
            resolve_item_url(
                "oai:radar.example.ca:10.5072_FK2_ABC",
                Some("https://radar.example.ca/item/%id%"),
                None
            )
            .as_deref(),
            Some("https://radar.example.ca/item/10.5072:FK2:ABC")
        );
    }

    #[test]
    fn pattern_without_oai_uses_full_identifier() {
        assert_eq!(
            resolve_item_url("dataset-17", Some("https://repo.example/ds/%id%"), None).as_deref(),
            Some("https://repo.example/ds/dataset-17")
        );
    }

    #[test]
    fn doi_is_rewritten_to_resolver_url() {
        assert_eq!(
            resolve_item_url("doi: 10.20383/101.0123.", None, None).as_deref(),
            Some("https://doi.org/10.20383/101.0123")
        );
        assert_eq!(
            resolve_item_url("DOI:10.1/abc", None, Some("https://ignored")).as_deref(),
            Some("https://doi.org/10.1/abc")
        );
    }

    #[test]
    fn source_url_then_embedded_url_are_fallbacks() {
        assert_eq!(
            resolve_item_url("local-9", None, Some("https://source.example/9")).as_deref(),
            Some("https://source.example/9")
        );
        assert_eq!(
            resolve_item_url("see https://embedded.example.org/a/b?c=1 for details", None, None)
                .as_deref(),
            Some("https://embedded.example.org/a/b?c=1")
        );
        assert_eq!(resolve_item_url("plain-id", None, Some("ftp-ish")), None);
    }

    #[test]
    fn pub_dates_are_validated_and_normalized() {
        assert_eq!(normalize_pub_date("2021").as_deref(), Some("2021"));
        assert_eq!(normalize_pub_date("2021-3").as_deref(), Some("2021-03"));
        assert_eq!(normalize_pub_date("2021-03-09T10:00:00Z").as_deref(), Some("2021-03-09"));
        assert_eq!(normalize_pub_date("2021-02-30"), None);
        assert_eq!(normalize_pub_date("21-02-03"), None);
        assert_eq!(normalize_pub_date(""), None);
        assert_eq!(normalize_pub_date("unknown"), None);
    }
}
