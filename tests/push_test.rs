//! Server push acceptance, consumption and eviction.

mod common;

use common::{TestServer, BACKENDS};
use http::{HeaderMap, StatusCode, Version};
use muxnet::engine::BackendKind;
use muxnet::{Client, LoadState, PushVerdict, PushedStream, RequestOptions, ResponseHead};

fn pushed_body(body: &'static str) -> PushedStream {
    let mut headers = HeaderMap::new();
    headers.insert("content-length", body.len().into());
    let head = ResponseHead {
        status: StatusCode::OK,
        version: Version::HTTP_2,
        headers,
    };
    PushedStream::from_response(head, body)
}

fn promise(server: &TestServer, path: &str) -> Vec<String> {
    vec![
        ":method: GET".to_string(),
        ":scheme: http".to_string(),
        format!(":authority: 127.0.0.1:{}", server.port()),
        format!(":path: {}", path),
    ]
}

/// Client and a finished parent request to `/`.
fn setup(max_pending: usize) -> (TestServer, Client, muxnet::ResponseHandle) {
    setup_on(BackendKind::default(), max_pending)
}

fn setup_on(backend: BackendKind, max_pending: usize) -> (TestServer, Client, muxnet::ResponseHandle) {
    let server = TestServer::start();
    let client = Client::builder()
        .backend(backend)
        .max_pending_pushes(max_pending)
        .build()
        .unwrap();
    let parent = client.get(&server.url("/")).unwrap();
    assert_eq!(parent.status().unwrap(), StatusCode::OK);
    (server, client, parent)
}

#[test]
fn test_oldest_push_evicted_first() {
    for backend in BACKENDS {
        let (server, client, parent) = setup_on(backend, 2);

        for path in ["/a", "/b", "/c"] {
            let verdict = client.offer_push(&parent, &promise(&server, path), pushed_body("pushed"));
            assert_eq!(verdict, PushVerdict::Ok);
        }

        assert_eq!(client.state().pending_push_count(), 2);
        assert!(!client.state().has_pending_push(&server.url("/a")));
        assert!(client.state().has_pending_push(&server.url("/b")));
        assert!(client.state().has_pending_push(&server.url("/c")));
    }
}

#[test]
fn test_push_for_foreign_authority_denied() {
    let (server, client, parent) = setup(10);

    let mut headers = promise(&server, "/x");
    headers[2] = ":authority: evil.test".to_string();
    let verdict = client.offer_push(&parent, &headers, pushed_body("nope"));

    assert_eq!(verdict, PushVerdict::Deny);
    assert_eq!(client.state().pending_push_count(), 0);
}

#[test]
fn test_push_missing_pseudo_header_denied() {
    let (server, client, parent) = setup(10);

    let mut headers = promise(&server, "/x");
    headers.remove(0);
    let verdict = client.offer_push(&parent, &headers, pushed_body("nope"));

    assert_eq!(verdict, PushVerdict::Deny);
}

#[test]
fn test_matching_request_consumes_push() {
    for backend in BACKENDS {
        let (server, client, parent) = setup_on(backend, 10);
        let served_before = server.stats.requests();

        let verdict = client.offer_push(&parent, &promise(&server, "/style.css"), pushed_body("body{}"));
        assert_eq!(verdict, PushVerdict::Ok);

        let handle = client.get(&server.url("/style.css")).unwrap();
        assert_eq!(handle.status().unwrap(), StatusCode::OK);
        assert_eq!(&handle.content().unwrap()[..], b"body{}", "{backend:?}");

        assert_eq!(server.stats.requests(), served_before, "{backend:?}");
        assert_eq!(client.state().pending_push_count(), 0);
        assert_eq!(
            handle.info().history,
            vec![LoadState::Created, LoadState::ReceivingBody, LoadState::Completed]
        );
    }
}

#[test]
fn test_incompatible_request_goes_to_network() {
    for backend in BACKENDS {
        let (server, client, parent) = setup_on(backend, 10);
        let url = server.url("/private");

        client.offer_push(&parent, &promise(&server, "/private"), pushed_body("pushed"));

        let handle = client
            .request("GET", &url, RequestOptions::new().header("Cookie", "session=1"))
            .unwrap();
        assert_eq!(&handle.content().unwrap()[..], b"/private", "{backend:?}");

        // The push is still there for a compatible request.
        assert!(client.state().has_pending_push(&url));
        let handle = client.get(&url).unwrap();
        assert_eq!(&handle.content().unwrap()[..], b"pushed", "{backend:?}");
        assert!(!client.state().has_pending_push(&url));
    }
}

#[test]
fn test_request_with_body_never_consumes() {
    let (server, client, parent) = setup(10);
    let url = server.url("/form");

    client.offer_push(&parent, &promise(&server, "/form"), pushed_body("pushed"));

    let handle = client
        .request("GET", &url, RequestOptions::new().body("x=1"))
        .unwrap();
    assert_eq!(&handle.content().unwrap()[..], b"/form");
    assert!(client.state().has_pending_push(&url));
}

#[test]
fn test_pushes_disabled() {
    let (server, client, parent) = setup(0);

    let verdict = client.offer_push(&parent, &promise(&server, "/a"), pushed_body("x"));

    assert_eq!(verdict, PushVerdict::Deny);
    assert_eq!(client.state().pending_push_count(), 0);
}

#[test]
fn test_reset_drops_pending_pushes() {
    let (server, client, parent) = setup(10);

    client.offer_push(&parent, &promise(&server, "/a"), pushed_body("x"));
    client.offer_push(&parent, &promise(&server, "/b"), pushed_body("y"));
    assert_eq!(client.state().pending_push_count(), 2);

    client.reset();

    assert_eq!(client.state().pending_push_count(), 0);
    let handle = client.get(&server.url("/a")).unwrap();
    assert_eq!(&handle.content().unwrap()[..], b"/a");
}

#[test]
fn test_repushed_url_replaces_entry() {
    let (server, client, parent) = setup(10);

    client.offer_push(&parent, &promise(&server, "/a"), pushed_body("old"));
    client.offer_push(&parent, &promise(&server, "/a"), pushed_body("new"));

    assert_eq!(client.state().pending_push_count(), 1);
    let handle = client.get(&server.url("/a")).unwrap();
    assert_eq!(&handle.content().unwrap()[..], b"new");
}
