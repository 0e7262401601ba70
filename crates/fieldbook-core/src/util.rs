//! Small helpers shared by config loading, the HTTP remote and the sync core.

/// Longest response-body excerpt carried into a [`crate::RemoteError`]
const BODY_EXCERPT_CHARS: usize = 180;

/// Trimmed text, or `None` for a missing or blank setting.
pub fn trimmed_non_empty(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToString::to_string)
}

/// Sync endpoints must name an http(s) scheme.
pub fn has_http_scheme(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Head of a server response body, safe to embed in an error message.
pub fn body_excerpt(body: &str) -> String {
    body.trim().chars().take(BODY_EXCERPT_CHARS).collect()
}

/// Wall clock in Unix milliseconds, the unit every stored timestamp uses.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_settings_read_as_unset() {
        assert_eq!(trimmed_non_empty(None), None);
        assert_eq!(trimmed_non_empty(Some("\t \n".to_string())), None);
        assert_eq!(
            trimmed_non_empty(Some("  fac-accra-01 ".to_string())),
            Some("fac-accra-01".to_string())
        );
    }

    #[test]
    fn only_http_endpoints_are_accepted() {
        assert!(has_http_scheme("http://10.0.0.5:8080"));
        assert!(has_http_scheme("https://sync.fieldbook.example"));
        assert!(!has_http_scheme("wss://sync.fieldbook.example"));
        assert!(!has_http_scheme("sync.fieldbook.example"));
    }

    #[test]
    fn excerpt_keeps_head_of_long_bodies() {
        let body = format!("  <html>{}</html>", "é".repeat(300));
        let excerpt = body_excerpt(&body);
        assert_eq!(excerpt.chars().count(), BODY_EXCERPT_CHARS);
        assert!(excerpt.starts_with("<html>"));
    }

    #[test]
    fn clock_is_in_milliseconds() {
        // 2020-01-01T00:00:00Z
        assert!(unix_millis_now() > 1_577_836_800_000);
    }
}
