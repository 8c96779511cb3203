use cfclient::{
    ClientError, CloudController, Config, Endpoints, FilePart, Grant, ResourceFingerprint, Session,
    TokenSet,
};
use chrono::Utc;
use httpmock::prelude::*;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use url::Url;

fn session_for(server: &MockServer) -> Session {
    let base = Url::parse(&server.base_url()).unwrap();
    let endpoints = Endpoints::new(base.clone(), base.clone());
    Session::with_endpoints(Config::new(base), endpoints).unwrap()
}

fn controller(server: &MockServer, tokens: TokenSet) -> CloudController {
    let session = session_for(server);
    session.set_tokens(tokens);
    CloudController::new(session)
}

fn valid(access_token: &str) -> TokenSet {
    TokenSet::new(access_token.into(), Some("refresh-1".into()), 3600, Utc::now())
}

fn expired(access_token: &str) -> TokenSet {
    TokenSet::new(access_token.into(), Some("refresh-1".into()), 60, Utc::now() - chrono::Duration::seconds(600))
}

fn app(guid: &str, name: &str) -> serde_json::Value {
    json!({
        "metadata": {"guid": guid, "url": format!("/v2/apps/{guid}"), "created_at": "2020-08-12T14:28:11Z"},
        "entity": {"name": name, "space_guid": "s1", "space_url": "/v2/spaces/s1", "routes_url": format!("/v2/apps/{guid}/routes")}
    })
}

#[test]
fn test_discovery_and_password_grant() {
    let server = MockServer::start();
    let info = server.mock(|when, then| {
        when.method(GET).path("/v2/info");
        then.status(200).json_body(json!({
            "name": "",
            "api_version": "2.150.0",
            "authorization_endpoint": server.base_url(),
            "token_endpoint": server.base_url(),
            "doppler_logging_endpoint": "wss://doppler.example.com:443"
        }));
    });
    let token = server.mock(|when, then| {
        when.method(POST)
            .path("/oauth/token")
            .header("authorization", "Basic Y2Y6");
        then.status(200).json_body(json!({
            "access_token": "access-1",
            "refresh_token": "refresh-1",
            "token_type": "bearer",
            "expires_in": 599,
            "scope": "cloud_controller.read openid"
        }));
    });

    let session = Session::new(Config::parse(&server.base_url()).unwrap()).unwrap();
    assert_eq!(session.info().unwrap().api_version.as_deref(), Some("2.150.0"));
    assert_eq!(
        session.endpoints().logging.as_ref().unwrap().as_str(),
        "wss://doppler.example.com/"
    );

    let tokens = session.authenticate(Grant::password("admin", "secret")).unwrap();
    assert_eq!(tokens.access_token, "access-1");
    assert!(tokens.has_refresh_token());
    assert_eq!(session.ensure_valid().unwrap(), "access-1");

    info.assert();
    token.assert();
}

#[test]
fn test_rejected_credentials() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(401).json_body(json!({
            "error": "unauthorized",
            "error_description": "Bad credentials"
        }));
    });

    let session = session_for(&server);
    match session.authenticate(Grant::password("admin", "wrong")) {
        Err(ClientError::Auth {
            status,
            error,
            description,
        }) => {
            assert_eq!(status, 401);
            assert_eq!(error, "unauthorized");
            assert_eq!(description.as_deref(), Some("Bad credentials"));
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    assert!(session.tokens().is_none());
}

#[test]
fn test_concurrent_callers_share_one_refresh() {
    let server = MockServer::start();
    let token = server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200)
            .delay(Duration::from_millis(300))
            .json_body(json!({
                "access_token": "access-2",
                "refresh_token": "refresh-2",
                "expires_in": 3600
            }));
    });
    let apps = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/apps")
            .header("authorization", "bearer access-2");
        then.status(200).json_body(json!({"total_results": 0, "resources": []}));
    });

    let cc = controller(&server, expired("access-1"));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cc = cc.clone();
            thread::spawn(move || cc.request("/v2/apps").unwrap().get().map(|r| r.status()))
        })
        .collect();
    for worker in workers {
        assert_eq!(worker.join().unwrap().unwrap(), 200);
    }

    token.assert_hits(1);
    apps.assert_hits(8);
    let tokens = cc.session().tokens().unwrap();
    assert_eq!(tokens.access_token, "access-2");
    assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-2"));
}

#[test]
fn test_refresh_keeps_refresh_token_when_not_rotated() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200).json_body(json!({"access_token": "access-2", "expires_in": 3600}));
    });

    let session = session_for(&server);
    session.set_tokens(expired("access-1"));
    assert_eq!(session.ensure_valid().unwrap(), "access-2");
    assert_eq!(session.tokens().unwrap().refresh_token.as_deref(), Some("refresh-1"));
}

#[test]
fn test_rejected_token_is_refreshed_once_and_retried() {
    let server = MockServer::start();
    let stale = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/apps/a1")
            .header("authorization", "bearer access-1");
        then.status(401).json_body(json!({
            "code": 1000,
            "description": "Invalid Auth Token",
            "error_code": "CF-InvalidAuthToken"
        }));
    });
    let fresh = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/apps/a1")
            .header("authorization", "bearer access-2");
        then.status(200).json_body(app("a1", "web"));
    });
    let token = server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200).json_body(json!({"access_token": "access-2", "expires_in": 3600}));
    });

    let cc = controller(&server, valid("access-1"));
    let response = cc.request("/v2/apps/a1").unwrap().get().unwrap();
    assert_eq!(response.resource().unwrap().name(), Some("web"));

    stale.assert_hits(1);
    fresh.assert_hits(1);
    token.assert_hits(1);
}

#[test]
fn test_second_rejection_is_an_auth_error() {
    let server = MockServer::start();
    let spaces = server.mock(|when, then| {
        when.method(GET).path("/v2/spaces");
        then.status(401).json_body(json!({
            "description": "Invalid Auth Token",
            "error_code": "CF-InvalidAuthToken"
        }));
    });
    let token = server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200).json_body(json!({"access_token": "access-2", "expires_in": 3600}));
    });

    let cc = controller(&server, valid("access-1"));
    match cc.request("/v2/spaces").unwrap().get() {
        Err(ClientError::Auth { status, error, .. }) => {
            assert_eq!(status, 401);
            assert_eq!(error, "CF-InvalidAuthToken");
        }
        other => panic!("expected auth error, got {other:?}"),
    }
    spaces.assert_hits(2);
    token.assert_hits(1);
}

#[test]
fn test_one_shot_upload_cannot_be_replayed() {
    let server = MockServer::start();
    let bits = server.mock(|when, then| {
        when.method(PUT).path("/v2/apps/a1/bits");
        then.status(401).json_body(json!({"error_code": "CF-InvalidAuthToken"}));
    });
    let token = server.mock(|when, then| {
        when.method(POST).path("/oauth/token");
        then.status(200).json_body(json!({"access_token": "access-2", "expires_in": 3600}));
    });

    let cc = controller(&server, valid("access-1"));
    let archive = FilePart::from_reader(
        "application",
        "app.zip",
        std::io::Cursor::new(b"PK\x03\x04".to_vec()),
        "application/zip",
        None,
    );
    let result = cc.upload_bits("a1", archive, &[], false);
    assert!(matches!(result, Err(ClientError::TokenExpired)));
    bits.assert_hits(1);
    token.assert_hits(0);
}

#[test]
fn test_api_errors() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/v2/apps/missing");
        then.status(404).json_body(json!({
            "code": 100004,
            "description": "The app could not be found: missing",
            "error_code": "CF-AppNotFound"
        }));
    });
    server.mock(|when, then| {
        when.method(DELETE).path("/v3/spaces/s1");
        then.status(403).json_body(json!({
            "errors": [{"code": 10003, "title": "CF-NotAuthorized", "detail": "You are not authorized to perform the requested action"}]
        }));
    });

    let cc = controller(&server, valid("access-1"));

    let err = cc.request("/v2/apps/missing").unwrap().get().unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.status_code(), Some(404));
    match &err {
        ClientError::Api { code, message, .. } => {
            assert_eq!(code.as_deref(), Some("CF-AppNotFound"));
            assert_eq!(message, "The app could not be found: missing");
        }
        other => panic!("expected api error, got {other:?}"),
    }

    let err = cc.request("/v3/spaces/s1").unwrap().delete().unwrap_err();
    assert!(err.is_permission_denied());
    assert!(!err.is_retryable());
}

#[test]
fn test_get_by_name_filters_and_empty_means_absent() {
    let server = MockServer::start();
    let found = server.mock(|when, then| {
        when.method(GET).path("/v2/apps").query_param("q", "name:web");
        then.status(200).json_body(json!({
            "total_results": 1,
            "total_pages": 1,
            "next_url": null,
            "resources": [app("a1", "web")]
        }));
    });
    let absent = server.mock(|when, then| {
        when.method(GET).path("/v2/apps").query_param("q", "name:worker");
        then.status(200).json_body(json!({"total_results": 0, "total_pages": 1, "resources": []}));
    });

    let cc = controller(&server, valid("access-1"));

    let response = cc.request("/v2/apps").unwrap().get_by_name("web").unwrap();
    let web = response.resource().unwrap();
    assert_eq!(web.guid(), Some("a1"));
    assert_eq!(web.link("space"), Some("/v2/spaces/s1"));

    let response = cc.request("/v2/apps").unwrap().get_by_name("worker").unwrap();
    assert!(response.is_collection());
    assert!(response.resource().is_none());

    found.assert();
    absent.assert();
}

#[test]
fn test_pagination_follows_next_url() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(GET).path("/v2/apps").query_param("page", "1");
        then.status(200).json_body(json!({
            "total_results": 3,
            "total_pages": 2,
            "prev_url": null,
            "next_url": "/v2/apps?order-direction=asc&page=2&results-per-page=2",
            "resources": [app("a1", "api"), app("a2", "web")]
        }));
    });
    let second = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/apps")
            .query_param("page", "2")
            .query_param("results-per-page", "2");
        then.status(200).json_body(json!({
            "total_results": 3,
            "total_pages": 2,
            "prev_url": "/v2/apps?order-direction=asc&page=1&results-per-page=2",
            "next_url": null,
            "resources": [app("a3", "worker")]
        }));
    });

    let cc = controller(&server, valid("access-1"));
    let mut apps = cc.request("/v2/apps").unwrap().set_query("page", "1").all();
    let names: Vec<String> = apps
        .by_ref()
        .map(|app| app.unwrap().name().unwrap().to_string())
        .collect();

    assert_eq!(names, vec!["api", "web", "worker"]);
    assert_eq!(apps.pages_fetched(), 2);
    assert_eq!(apps.total_results(), Some(3));
    assert!(apps.next().is_none());
    first.assert_hits(1);
    second.assert_hits(1);
}

#[test]
fn test_v3_pagination_and_links() {
    let server = MockServer::start();
    let next = server.url("/v3/apps?page=2&per_page=1");
    server.mock(|when, then| {
        when.method(GET).path("/v3/apps").query_param("page", "2");
        then.status(200).json_body(json!({
            "pagination": {"total_results": 2, "total_pages": 2, "next": null},
            "resources": [{"guid": "b2", "name": "second", "links": {"self": {"href": "/v3/apps/b2"}}}]
        }));
    });
    server.mock(|when, then| {
        when.method(GET).path("/v3/apps").query_param("per_page", "1").query_param("page", "1");
        then.status(200).json_body(json!({
            "pagination": {"total_results": 2, "total_pages": 2, "next": {"href": next}},
            "resources": [{
                "guid": "b1",
                "name": "first",
                "links": {"self": {"href": "/v3/apps/b1"}, "space": {"href": "/v3/spaces/s1"}}
            }]
        }));
    });
    let space = server.mock(|when, then| {
        when.method(GET).path("/v3/spaces/s1");
        then.status(200).json_body(json!({"guid": "s1", "name": "dev"}));
    });

    let cc = controller(&server, valid("access-1"));
    let apps: Vec<_> = cc
        .request("/v3/apps?page=1&per_page=1")
        .unwrap()
        .all()
        .collect::<Result<_, _>>()
        .unwrap();
    let guids: Vec<_> = apps.iter().map(|a| a.guid().unwrap()).collect();
    assert_eq!(guids, vec!["b1", "b2"]);

    assert!(cc.follow(&apps[1], "space").is_none());
    let response = cc.follow(&apps[0], "space").unwrap().unwrap().get().unwrap();
    assert_eq!(response.resource().unwrap().name(), Some("dev"));
    space.assert();
}

#[test]
fn test_pagination_stops_after_error() {
    let server = MockServer::start();
    let page = server.mock(|when, then| {
        when.method(GET).path("/v2/routes");
        then.status(500).json_body(json!({"error_code": "UnknownError", "description": "boom"}));
    });

    let cc = controller(&server, valid("access-1"));
    let mut routes = cc.request("/v2/routes").unwrap().all();
    let err = routes.next().unwrap().unwrap_err();
    assert!(err.is_retryable());
    assert!(routes.next().is_none());
    assert!(routes.next().is_none());
    page.assert_hits(1);
}

#[test]
fn test_pagination_refuses_to_revisit_a_page() {
    let server = MockServer::start();
    let page = server.mock(|when, then| {
        when.method(GET).path("/v2/apps").query_param("page", "1");
        then.status(200).json_body(json!({
            "total_results": 2,
            "total_pages": 2,
            "next_url": "/v2/apps?page=1",
            "resources": [app("a1", "api")]
        }));
    });

    let cc = controller(&server, valid("access-1"));
    let mut apps = cc.request("/v2/apps?page=1").unwrap().all();
    assert_eq!(apps.next().unwrap().unwrap().guid(), Some("a1"));
    match apps.next() {
        Some(Err(ClientError::PageRevisited(url))) => assert!(url.ends_with("/v2/apps?page=1")),
        other => panic!("expected revisited page error, got {other:?}"),
    }
    assert!(apps.next().is_none());
    assert_eq!(apps.pages_fetched(), 1);
    page.assert_hits(1);
}

#[test]
fn test_pagination_keeps_request_headers() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/stacks")
            .query_param("page", "1")
            .header("x-correlation-id", "run-42");
        then.status(200).json_body(json!({
            "total_results": 2,
            "next_url": "/v2/stacks?page=2",
            "resources": [app("st1", "cflinuxfs3")]
        }));
    });
    let second = server.mock(|when, then| {
        when.method(GET)
            .path("/v2/stacks")
            .query_param("page", "2")
            .header("x-correlation-id", "run-42");
        then.status(200).json_body(json!({
            "total_results": 2,
            "next_url": null,
            "resources": [app("st2", "cflinuxfs4")]
        }));
    });

    let cc = controller(&server, valid("access-1"));
    let names: Vec<String> = cc
        .request("/v2/stacks?page=1")
        .unwrap()
        .header("X-Correlation-Id", "run-42")
        .all()
        .map(|stack| stack.unwrap().name().unwrap().to_string())
        .collect();

    assert_eq!(names, vec!["cflinuxfs3", "cflinuxfs4"]);
    first.assert_hits(1);
    second.assert_hits(1);
}

#[test]
fn test_post_sends_json_fields() {
    let server = MockServer::start();
    let create = server.mock(|when, then| {
        when.method(POST)
            .path("/v2/apps")
            .header("content-type", "application/json")
            .json_body(json!({"name": "web", "space_guid": "s1", "instances": 2}));
        then.status(201).json_body(app("a9", "web"));
    });

    let cc = controller(&server, valid("access-1"));
    let response = cc
        .request("/v2/apps")
        .unwrap()
        .add_field("name", "web")
        .add_field("space_guid", "s1")
        .add_field("instances", 2)
        .post()
        .unwrap();
    assert_eq!(response.status(), 201);
    assert_eq!(response.resource().unwrap().guid(), Some("a9"));
    create.assert();
}

#[test]
fn test_upload_bits() {
    let server = MockServer::start();
    let bits = server.mock(|when, then| {
        when.method(PUT)
            .path("/v2/apps/a1/bits")
            .query_param("async", "true")
            .header("authorization", "bearer access-1")
            .header_exists("content-type");
        then.status(201).json_body(json!({
            "metadata": {"guid": "job-1", "url": "/v2/jobs/job-1", "created_at": "2020-08-12T14:28:11Z"},
            "entity": {"guid": "job-1", "status": "queued"}
        }));
    });

    let mut archive = vec![0u8; 64 * 1024];
    rand::thread_rng().fill_bytes(&mut archive);
    let archive = FilePart::from_bytes("application", "application.zip", archive, "application/zip");
    let fingerprints = [ResourceFingerprint {
        path: "public/index.html".into(),
        size: 1024,
        sha1: "2fd4e1c67a2d28fced849ee1bb76e7391b93eb12".into(),
        mode: Some("644".into()),
    }];

    let cc = controller(&server, valid("access-1"));
    let response = cc.upload_bits("a1", archive, &fingerprints, true).unwrap();
    let job = response.resource().unwrap();
    assert_eq!(job.guid(), Some("job-1"));
    assert_eq!(job.attribute_str("entity/status"), Some("queued"));
    bits.assert();
}

#[test]
fn test_shared_session_across_controllers() {
    let server = MockServer::start();
    let apps = server.mock(|when, then| {
        when.method(GET).path("/v2/apps");
        then.status(200).json_body(json!({"resources": []}));
    });

    let session = Arc::new(session_for(&server));
    session.set_tokens(valid("access-1"));
    let a = CloudController::from_shared(session.clone());
    let b = CloudController::from_shared(session);
    a.request("/v2/apps").unwrap().get().unwrap();
    b.request("/v2/apps").unwrap().get().unwrap();
    apps.assert_hits(2);
}

#[test]
#[ignore] // Run with: CF_API=... CF_USERNAME=... CF_PASSWORD=... cargo test -- --ignored
fn test_live_list_organizations() {
    let api = std::env::var("CF_API").expect("CF_API");
    let session = Session::new(Config::parse(&api).unwrap()).unwrap();
    session
        .authenticate(Grant::password(
            std::env::var("CF_USERNAME").expect("CF_USERNAME"),
            std::env::var("CF_PASSWORD").expect("CF_PASSWORD"),
        ))
        .unwrap();

    let cc = CloudController::new(session);
    for org in cc.request("/v2/organizations").unwrap().all() {
        let org = org.unwrap();
        println!("{} {}", org.guid().unwrap_or("?"), org.name().unwrap_or("?"));
    }
}
