use regex::Regex;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::config::Manifest;

fn entry_from_yaml(yaml: &str) -> ApiEntry {
    let mut manifest = Manifest::from_str(yaml).expect("manifest parses");
    manifest.apis.remove(0)
}

// ---------------------------------------------------------------------------
// Hook behavior
// ---------------------------------------------------------------------------

#[tokio::test]
async fn url_date_bump_advances_stored_date_by_one_second() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "value": [
                {"createdDateTime": "2024-05-29T10:00:00Z"},
                {"createdDateTime": "2024-05-28T16:00:00Z"}
            ]
        })))
        .mount(&server)
        .await;

    let base = format!("{}/v1/auditLogs/signIns", server.uri());
    let fetcher = ApiFetcher::new(format!(
        "{base}?$filter=createdDateTime gt 2024-05-28T13:08:54Z"
    ))
    .with_response_data_path("value")
    .unwrap()
    .with_next_url(&format!(
        "{base}?$filter=createdDateTime gt {{res.value.[0].createdDateTime}}"
    ))
    .unwrap();

    let mut source = Source::new(fetcher).with_hook(SourceHook::UrlDateBump {
        seconds: 1,
        format: URL_DATE_FORMAT.to_string(),
        pattern: Regex::new(r"gt (\S+)$").unwrap(),
        advance_on_empty: false,
    });

    let records = source.run_tick().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(
        source.fetcher.url,
        format!("{base}?$filter=createdDateTime gt 2024-05-29T10:00:01Z")
    );
}

#[tokio::test]
async fn url_date_bump_skips_empty_ticks_by_default() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": []})))
        .mount(&server)
        .await;

    let url = format!(
        "{}/logs?$filter=createdDateTime gt 2024-05-28T13:08:54Z",
        server.uri()
    );
    let fetcher = ApiFetcher::new(url.clone())
        .with_response_data_path("value")
        .unwrap();
    let mut source = Source::new(fetcher).with_hook(SourceHook::UrlDateBump {
        seconds: 1,
        format: URL_DATE_FORMAT.to_string(),
        pattern: Regex::new(r"gt (\S+)$").unwrap(),
        advance_on_empty: false,
    });

    let records = source.run_tick().await.unwrap();
    assert!(records.is_empty());
    assert_eq!(source.fetcher.url, url);
}

#[tokio::test]
async fn now_date_hook_rewrites_placeholder_before_call() {
    let mut fetcher = ApiFetcher::new(
        "https://reports/api?$filter=StartDate eq datetime '2024-05-28T13:08:54Z' \
         and EndDate eq datetime 'NOW_DATE'",
    );
    let mut hook = SourceHook::NowDate {
        token: "NOW_DATE".to_string(),
        format: URL_DATE_FORMAT.to_string(),
    };

    hook.on_before_call(&mut fetcher).await.unwrap();
    assert!(!fetcher.url.contains("NOW_DATE"));
    // The substituted instant parses back in the URL date format.
    let end = fetcher.url.rsplit('\'').nth(1).unwrap();
    assert!(chrono::NaiveDateTime::parse_from_str(end, URL_DATE_FORMAT).is_ok());
}

#[tokio::test]
async fn jwt_login_caches_token_until_auth_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/users/login"))
        .and(body_json(json!({"username": "me", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "jwt-1"})))
        .expect(2)
        .mount(&server)
        .await;

    let mut fetcher = ApiFetcher::new("https://hub/api");
    let mut hook = SourceHook::JwtLogin {
        login_url: format!("{}/v2/users/login", server.uri()),
        username: "me".to_string(),
        password: "secret".to_string(),
        jwt: None,
    };

    hook.on_before_call(&mut fetcher).await.unwrap();
    assert_eq!(
        fetcher.headers.get("Authorization").map(String::as_str),
        Some("Bearer jwt-1")
    );

    // Cached: a second call performs no new login.
    hook.on_before_call(&mut fetcher).await.unwrap();

    // A 401 on the data endpoint clears the cache; the next call logs in
    // again.
    hook.on_auth_failure();
    hook.on_before_call(&mut fetcher).await.unwrap();
}

#[tokio::test]
async fn jwt_login_failure_is_a_transient_tick_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut fetcher = ApiFetcher::new("https://hub/api");
    let mut hook = SourceHook::JwtLogin {
        login_url: format!("{}/v2/users/login", server.uri()),
        username: "me".to_string(),
        password: "secret".to_string(),
        jwt: None,
    };

    let err = hook.on_before_call(&mut fetcher).await.unwrap_err();
    assert!(matches!(err, FetchError::TokenRefresh { .. }));
}

#[test]
fn body_cursor_takes_the_last_records_timestamp() {
    let mut fetcher = ApiFetcher::new("https://events/api")
        .with_body(&json!({"limit": 100, "start_time": "2024-01-01T00:00:00Z"}));
    let mut hook = SourceHook::BodyCursor {
        body_key: "start_time".to_string(),
        timestamp_path: JsonPath::parse("timestamp").unwrap(),
    };

    let records = vec![
        json!({"timestamp": "2024-06-01T08:00:00Z"}),
        json!({"timestamp": "2024-06-01T09:30:00Z"}),
    ];
    hook.on_after_tick(&mut fetcher, &records);

    let body: Value = serde_json::from_str(fetcher.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["start_time"], "2024-06-01T09:30:00Z");
    assert_eq!(body["limit"], 100);
}

#[test]
fn body_cursor_leaves_body_alone_on_empty_tick() {
    let mut fetcher = ApiFetcher::new("https://events/api").with_body(&json!({"limit": 100}));
    let before = fetcher.body.clone();
    let mut hook = SourceHook::BodyCursor {
        body_key: "start_time".to_string(),
        timestamp_path: JsonPath::parse("timestamp").unwrap(),
    };

    hook.on_after_tick(&mut fetcher, &[]);
    assert_eq!(fetcher.body, before);
}

#[test]
fn body_cursor_without_timestamp_leaves_body_alone() {
    let mut fetcher = ApiFetcher::new("https://events/api").with_body(&json!({"limit": 100}));
    let before = fetcher.body.clone();
    let mut hook = SourceHook::BodyCursor {
        body_key: "start_time".to_string(),
        timestamp_path: JsonPath::parse("timestamp").unwrap(),
    };

    hook.on_after_tick(&mut fetcher, &[json!({"no_ts": true})]);
    assert_eq!(fetcher.body, before);
}

// ---------------------------------------------------------------------------
// Adapter constructors
// ---------------------------------------------------------------------------

#[test]
fn azure_graph_builds_filtered_url_and_oauth() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: azure_graph
    name: azure graph audit
    azure_ad_tenant_id: my-tenant
    azure_ad_client_id: my-client
    azure_ad_secret_value: my-secret
    data_request:
      url: https://graph.microsoft.com/v1.0/auditLogs/signIns
    days_back_fetch: 2
",
    );

    let source = build_source(entry).unwrap();
    assert_eq!(source.name(), "azure graph audit");
    assert!(source.auth.is_some());
    assert!(matches!(source.hook, SourceHook::UrlDateBump { seconds: 1, .. }));
    assert!(source
        .fetcher
        .url
        .starts_with("https://graph.microsoft.com/v1.0/auditLogs/signIns?$filter=createdDateTime gt "));
}

#[test]
fn azure_mail_reports_builds_start_and_end_dates() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: azure_mail_reports
    azure_ad_tenant_id: my-tenant
    azure_ad_client_id: my-client
    azure_ad_secret_value: my-secret
    data_request:
      url: https://reports.office365.com/ecp/reportingwebservice/reporting.svc/MessageTrace
",
    );

    let source = build_source(entry).unwrap();
    assert!(source.auth.is_some());
    assert!(matches!(source.hook, SourceHook::NowDate { .. }));
    assert!(source.fetcher.url.contains("$filter=StartDate eq datetime '"));
    assert!(source.fetcher.url.contains("and EndDate eq datetime '"));
    assert!(!source.fetcher.url.contains("NOW_DATE"));
}

#[tokio::test]
async fn cloudflare_pages_until_empty_and_bumps_since() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/accounts/acc-1/audit_logs"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [],
            "result_info": {"page": 2}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/accounts/acc-1/audit_logs"))
        .and(header("Authorization", "Bearer cf-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "result": [{"action": "login"}],
            "result_info": {"page": 1}
        })))
        .mount(&server)
        .await;

    let entry = entry_from_yaml(&format!(
        r"
apis:
  - type: cloudflare
    name: cloudflare audit
    url: {}/accounts/{{account_id}}/audit_logs
    cloudflare_account_id: acc-1
    cloudflare_bearer_token: cf-token
    days_back_fetch: 1
",
        server.uri()
    ));
    let mut source = build_source(entry).unwrap();

    assert!(source.fetcher.url.contains("/accounts/acc-1/audit_logs?since="));
    let since_pattern = Regex::new(r"since=([^&\s]+)").unwrap();
    let seeded = since_pattern
        .captures(&source.fetcher.url)
        .unwrap()[1]
        .to_string();

    let records = source.run_tick().await.unwrap();
    assert_eq!(records, vec![json!({"action": "login"})]);

    // The stored since date moved one second past its seed.
    let bumped = since_pattern
        .captures(&source.fetcher.url)
        .unwrap()[1]
        .to_string();
    let seeded_date = chrono::NaiveDateTime::parse_from_str(&seeded, URL_DATE_FORMAT).unwrap();
    let bumped_date = chrono::NaiveDateTime::parse_from_str(&bumped, URL_DATE_FORMAT).unwrap();
    assert_eq!(bumped_date - seeded_date, chrono::Duration::seconds(1));
}

#[test]
fn cloudflare_page_fragment_respects_existing_query() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: cloudflare
    url: https://api.cloudflare.com/client/v4/accounts/{account_id}/audit_logs
    cloudflare_account_id: acc-9
    cloudflare_bearer_token: tok
",
    );
    let source = build_source(entry).unwrap();
    // No since filter requested, so no hook and no query in the URL.
    assert!(matches!(source.hook, SourceHook::None));
    assert_eq!(
        source.fetcher.url,
        "https://api.cloudflare.com/client/v4/accounts/acc-9/audit_logs"
    );
}

#[test]
fn dockerhub_appends_page_size_and_from_filter() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: dockerhub
    name: dockerhub audit
    url: https://hub.docker.com/v2/auditlogs/my-org
    dockerhub_user: me
    dockerhub_token: secret
    days_back_fetch: 3
",
    );
    let source = build_source(entry).unwrap();

    assert!(source.fetcher.url.contains("?page_size=100&from="));
    assert!(matches!(source.hook, SourceHook::JwtLogin { jwt: None, .. }));
    assert_eq!(
        source.fetcher.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
}

#[tokio::test]
async fn onepassword_full_tick_updates_start_time() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/auditevents"))
        .and(header("Authorization", "Bearer op-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"t": 1, "timestamp": "2024-06-02T10:00:00Z"},
                {"t": 2, "timestamp": "2024-06-02T11:00:00Z"}
            ],
            "has_more": false
        })))
        .mount(&server)
        .await;

    let entry = entry_from_yaml(&format!(
        r"
apis:
  - type: onepassword
    name: onepassword events
    url: {}/api/v1/auditevents
    method: POST
    onepassword_bearer_token: op-token
    onepassword_limit: 50
",
        server.uri()
    ));
    let mut source = build_source(entry).unwrap();

    let records = source.run_tick().await.unwrap();
    assert_eq!(records.len(), 2);

    let body: Value = serde_json::from_str(source.fetcher.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["limit"], 50);
    assert_eq!(body["start_time"], "2024-06-02T11:00:00Z");
}

#[test]
fn onepassword_limit_out_of_range_rejected() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: onepassword
    url: https://events.1password.com/api/v1/auditevents
    onepassword_bearer_token: tok
    onepassword_limit: 5000
",
    );
    assert!(matches!(
        build_source(entry),
        Err(ConfigError::InvalidValue { .. })
    ));
}

#[test]
fn google_workspace_builds_refresh_token_grant() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: google_workspace
    name: google activity
    url: https://admin.googleapis.com/admin/reports/v1/activity/users/all/applications/login
    google_workspace_client_id: cid
    google_workspace_client_secret: cs
    google_workspace_refresh_token: rt
    days_back_fetch: 1
",
    );
    let source = build_source(entry).unwrap();

    assert!(source.auth.is_some());
    assert!(matches!(source.hook, SourceHook::BodyCursor { .. }));
    let body: Value = serde_json::from_str(source.fetcher.body.as_deref().unwrap()).unwrap();
    assert_eq!(body["limit"], 100);
    assert!(body.get("start_time").is_some());
}

#[test]
fn cisco_xdr_merges_default_headers_under_manifest_headers() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: cisco_xdr
    name: cisco incidents
    cisco_client_id: id
    client_password: pw
    data_request:
      url: https://visibility.amp.cisco.com/iroh/iroh-collect/incidents
      headers:
        Accept: application/vnd.custom+json
",
    );
    let source = build_source(entry).unwrap();

    assert!(source.auth.is_some());
    assert_eq!(
        source.fetcher.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
    // The manifest's explicit header wins over the adapter default.
    assert_eq!(
        source.fetcher.headers.get("Accept").map(String::as_str),
        Some("application/vnd.custom+json")
    );
}

#[test]
fn general_entry_builds_a_plain_source() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: general
    name: plain
    url: https://some/api
    scrape_interval: 5
",
    );
    let source = build_source(entry).unwrap();
    assert_eq!(source.name(), "plain");
    assert!(source.auth.is_none());
    assert!(matches!(source.hook, SourceHook::None));
    assert_eq!(
        source.fetcher.scrape_interval(),
        std::time::Duration::from_secs(300)
    );
}

#[test]
fn oauth_entry_defaults_json_content_type() {
    let entry = entry_from_yaml(
        r"
apis:
  - type: oauth
    token_request:
      url: https://token/endpoint
      method: POST
    data_request:
      url: https://data/endpoint
",
    );
    let source = build_source(entry).unwrap();
    assert_eq!(
        source.fetcher.headers.get("Content-Type").map(String::as_str),
        Some("application/json")
    );
}
