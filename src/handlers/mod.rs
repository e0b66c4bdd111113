pub mod asr;

pub use asr::*;

use crate::config::AppConfig;
use actix_web::http::header::AUTHORIZATION;
use actix_web::HttpRequest;

/// Pick the provider token for a request.
///
/// An explicit token (body field, `start` message, `?token=`) wins, then an
/// `Authorization: Bearer` header, then the configured API key. The result
/// may be empty; recognition reports that as a missing token.
pub fn resolve_token(req: &HttpRequest, explicit: Option<&str>, config: &AppConfig) -> String {
    if let Some(token) = explicit.map(str::trim).filter(|t| !t.is_empty()) {
        return token.to_string();
    }

    if let Some(token) = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
    {
        return token;
    }

    config.asr.api_key.trim().to_string()
}

fn bearer_token(header: &str) -> Option<String> {
    let header = header.trim();
    let scheme = header.get(..7)?;
    if !scheme.eq_ignore_ascii_case("bearer ") {
        return None;
    }
    let token = header[7..].trim();
    (!token.is_empty()).then(|| token.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn test_token_resolution_order() {
        let mut config = AppConfig::default();
        config.asr.api_key = "configured".into();

        let req = TestRequest::default()
            .insert_header(("Authorization", "Bearer from-header"))
            .to_http_request();
        assert_eq!(resolve_token(&req, Some(" explicit "), &config), "explicit");
        assert_eq!(resolve_token(&req, Some("  "), &config), "from-header");

        let req = TestRequest::default()
            .insert_header(("Authorization", "Basic abc"))
            .to_http_request();
        assert_eq!(resolve_token(&req, None, &config), "configured");

        config.asr.api_key.clear();
        assert_eq!(resolve_token(&req, None, &config), "");
    }

    #[test]
    fn test_bearer_parsing() {
        assert_eq!(bearer_token("bearer abc").as_deref(), Some("abc"));
        assert_eq!(bearer_token("BEARER   xyz ").as_deref(), Some("xyz"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Token abc"), None);
    }
}
