use super::*;

#[test]
fn test_defaults_are_sane() {
    let cfg = GatewayConfig::default();
    assert_eq!(cfg.fetch.static_timeout_secs, 20);
    assert_eq!(cfg.fetch.proxy_timeout_secs, 20);
    assert_eq!(cfg.fetch.archive_index_timeout_secs, 5);
    assert_eq!(cfg.fetch.archive_body_timeout_secs, 10);
    assert!(cfg.browser.max_concurrent >= 1);
    assert_eq!(cfg.browser.queue_timeout_ms, 10_000);
    assert_eq!(cfg.cache.default_ttl_secs, 3600);
    assert_eq!(cfg.cache.dynamic_ttl_secs, 600);
    assert!(cfg.api_token.is_none());
    cfg.validate().unwrap();
}

#[test]
fn test_toml_roundtrip_partial() {
    let cfg: GatewayConfig = toml::from_str(
        r#"
        [browser]
        max_concurrent = 4

        [cache]
        default_ttl_secs = 120
        "#,
    )
    .unwrap();
    assert_eq!(cfg.browser.max_concurrent, 4);
    // untouched sections keep defaults
    assert_eq!(cfg.browser.queue_timeout_ms, 10_000);
    assert_eq!(cfg.cache.default_ttl_secs, 120);
    assert_eq!(cfg.cache.dynamic_ttl_secs, 600);
}

#[test]
fn test_json_config_accepted() {
    let cfg: GatewayConfig = serde_json::from_str(
        r#"{"fetch": {"static_timeout_secs": 5}, "api_token": "secret"}"#,
    )
    .unwrap();
    assert_eq!(cfg.fetch.static_timeout_secs, 5);
    assert_eq!(cfg.api_token.as_deref(), Some("secret"));
}

#[test]
fn test_validate_rejects_zero_gate() {
    let mut cfg = GatewayConfig::default();
    cfg.browser.max_concurrent = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.browser.queue_timeout_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_bad_proxy_url() {
    let mut cfg = GatewayConfig::default();
    cfg.proxy_url = Some("not a proxy".into());
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.proxy_url = Some("user:pass@proxy.example.com:8080".into());
    cfg.validate().unwrap();
}

#[test]
fn test_validate_rejects_bad_paywall_json() {
    let mut cfg = GatewayConfig::default();
    cfg.paywall_rules_json = Some("{not json".into());
    assert!(cfg.validate().is_err());

    let mut cfg = GatewayConfig::default();
    cfg.paywall_rules_json =
        Some(r#"[{"domains": ["example.com"], "googlebot": true, "jsonLd": true}]"#.into());
    cfg.validate().unwrap();
}
