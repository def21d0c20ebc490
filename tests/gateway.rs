mod common;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Duration;

use http::StatusCode;
use revproxy::{ServerOptions, State};

use common::{
    backend, body_backend, counting_listener, dead_addr, gateway, get, raw_exchange, trickle_backend,
};

#[tokio::test]
async fn text_route_and_unknown_path() {
    let gw = gateway(r#"{{ HandleFunc "/ok" (Text 200 "OK") }}"#, &[], ServerOptions::new()).await;

    assert_eq!(get(&gw.url("/ok"), &[]).await.unwrap(), (StatusCode::OK, "OK".to_owned()));
    assert_eq!(get(&gw.url("/missing"), &[]).await.unwrap().0, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn proxy_merges_query_and_forwards_only_allowed_headers() {
    let up = backend("up", Duration::ZERO).await;
    let template = r#"{{ HandlePrefix "/api/{id:[0-9]+}" (Proxy "http://{{ .BACKEND }}/v1/{{ .id }}?src=gw") }}"#;
    let gw = gateway(
        template,
        &[("BACKEND", up.to_string().as_str())],
        ServerOptions::new().allow_headers(["x-allowed"]),
    )
    .await;

    let (status, body) = get(
        &gw.url("/api/7/rest?user=1"),
        &[("x-allowed", "a"), ("x-allowed", "b"), ("x-secret", "s")],
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "up /v1/7?src=gw&user=1 allowed=a,b secret=-");
}

#[tokio::test]
async fn consistent_routes_stick_to_one_backend() {
    let (a, b, c) = (
        backend("a", Duration::ZERO).await,
        backend("b", Duration::ZERO).await,
        backend("c", Duration::ZERO).await,
    );
    let template = r#"
{{ with $path := "/consistent-hashing/{key}" -}}
  {{- $a := "http://{{ .A }}/{{ .key }}/" -}}
  {{- $b := "http://{{ .B }}/{{ .key }}/" -}}
  {{- $c := "http://{{ .C }}/{{ .key }}/" -}}
  {{ HandleFunc $path (ProxyConsistent $a $b $c) }}
{{- end }}"#;
    let kv = [("A", a.to_string()), ("B", b.to_string()), ("C", c.to_string())];
    let kv: Vec<(&str, &str)> = kv.iter().map(|(k, v)| (*k, v.as_str())).collect();
    let gw = gateway(template, &kv, ServerOptions::new()).await;

    let mut owner: HashMap<String, String> = HashMap::new();
    for round in 0..3 {
        for i in 0..30 {
            let key = format!("user-{i}");
            let (status, body) = get(&gw.url(&format!("/consistent-hashing/{key}")), &[]).await.unwrap();
            assert_eq!(status, StatusCode::OK);

            let (name, rest) = body.split_once(' ').unwrap();
            assert!(rest.starts_with(&format!("/{key}/")), "{body}");
            if round == 0 {
                owner.insert(key, name.to_owned());
            } else {
                assert_eq!(owner[&key], name, "{key} moved between backends");
            }
        }
    }
    let used: HashSet<&String> = owner.values().collect();
    assert!(used.len() > 1, "every key landed on {used:?}");
}

#[tokio::test]
async fn broken_route_answers_bad_gateway_without_affecting_others() {
    let template = r#"{{ HandleFunc "/broken" (Proxy "http://{{ .HOST") }}
{{ HandleFunc "/ok" (Text 200 "OK") }}"#;
    let gw = gateway(template, &[], ServerOptions::new()).await;

    let (status, body) = get(&gw.url("/broken"), &[]).await.unwrap();
    assert_eq!((status, body.as_str()), (StatusCode::BAD_GATEWAY, "Bad Gateway"));
    assert_eq!(get(&gw.url("/ok"), &[]).await.unwrap().0, StatusCode::OK);
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let dead = dead_addr().await;
    let template = r#"{{ HandleFunc "/" (Proxy "http://{{ .DEAD }}/") }}"#;
    let gw = gateway(template, &[("DEAD", dead.to_string().as_str())], ServerOptions::new()).await;

    assert_eq!(get(&gw.url("/"), &[]).await.unwrap().0, StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn unparseable_rendered_url_is_internal_error() {
    let template = r#"{{ HandleFunc "/x" (Proxy "{{ .NOPE }}/relative") }}"#;
    let gw = gateway(template, &[], ServerOptions::new()).await;

    let (status, body) = get(&gw.url("/x"), &[]).await.unwrap();
    assert_eq!((status, body.as_str()), (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error"));
}

#[tokio::test]
async fn stop_drains_in_flight_requests() {
    let slow = backend("slow", Duration::from_millis(300)).await;
    let template = r#"{{ HandleFunc "/slow" (Proxy "http://{{ .SLOW }}/") }}"#;
    let mut gw = gateway(template, &[("SLOW", slow.to_string().as_str())], ServerOptions::new()).await;
    assert_eq!(gw.server.state(), State::Listening);

    let url = gw.url("/slow");
    let pending = tokio::spawn(async move { get(&url, &[]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    gw.server.stop(Duration::from_secs(5)).await;
    assert_eq!(gw.server.state(), State::Stopped);
    assert!((&mut gw.task).await.unwrap().is_ok());

    let (status, body) = pending.await.unwrap().unwrap();
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("slow "));

    assert!(get(&gw.url("/slow"), &[]).await.is_err(), "listener should be closed");
}

#[tokio::test]
async fn stop_aborts_requests_past_the_deadline() {
    let stuck = backend("stuck", Duration::from_secs(30)).await;
    let template = r#"{{ HandleFunc "/stuck" (Proxy "http://{{ .STUCK }}/") }}"#;
    let gw = gateway(template, &[("STUCK", stuck.to_string().as_str())], ServerOptions::new()).await;

    let url = gw.url("/stuck");
    let pending = tokio::spawn(async move { get(&url, &[]).await });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = tokio::time::Instant::now();
    gw.server.stop(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(pending.await.unwrap().is_err());
}

#[tokio::test]
async fn write_timeout_drops_the_connection() {
    let slow = backend("slow", Duration::from_secs(5)).await;
    let template = r#"{{ HandleFunc "/slow" (Proxy "http://{{ .SLOW }}/") }}"#;
    let opts = ServerOptions::new().write_timeout(Duration::from_millis(200));
    let gw = gateway(template, &[("SLOW", slow.to_string().as_str())], opts).await;

    let started = tokio::time::Instant::now();
    assert!(get(&gw.url("/slow"), &[]).await.is_err());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test]
async fn https_targets_are_dialed() {
    let (up, accepted) = counting_listener().await;
    let template = r#"{{ HandleFunc "/secure" (Proxy "https://{{ .UP }}/") }}"#;
    let gw = gateway(template, &[("UP", up.to_string().as_str())], ServerOptions::new()).await;

    // The listener hangs up before the TLS handshake completes.
    assert_eq!(get(&gw.url("/secure"), &[]).await.unwrap().0, StatusCode::BAD_GATEWAY);
    assert!(accepted.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn write_timeout_cuts_off_a_trickling_body() {
    let slow = trickle_backend(10, Duration::from_millis(150)).await;
    let template = r#"{{ HandleFunc "/stream" (Proxy "http://{{ .SLOW }}/") }}"#;
    let opts = ServerOptions::new().write_timeout(Duration::from_millis(300));
    let gw = gateway(template, &[("SLOW", slow.to_string().as_str())], opts).await;

    let started = tokio::time::Instant::now();
    assert!(get(&gw.url("/stream"), &[]).await.is_err());
    assert!(started.elapsed() < Duration::from_millis(1200), "{:?}", started.elapsed());
}

#[tokio::test]
async fn trickling_body_within_write_timeout_is_relayed() {
    let up = trickle_backend(3, Duration::from_millis(20)).await;
    let template = r#"{{ HandleFunc "/stream" (Proxy "http://{{ .UP }}/") }}"#;
    let gw = gateway(template, &[("UP", up.to_string().as_str())], ServerOptions::new()).await;

    assert_eq!(get(&gw.url("/stream"), &[]).await.unwrap(), (StatusCode::OK, "hellohellohello".to_owned()));
}

#[tokio::test]
async fn read_timeout_fails_a_stalled_request_body() {
    let up = body_backend().await;
    let template = r#"{{ HandleFunc "/upload" (Proxy "http://{{ .UP }}/") }}"#;
    let opts = ServerOptions::new().read_timeout(Duration::from_millis(300));
    let gw = gateway(template, &[("UP", up.to_string().as_str())], opts).await;

    let complete = b"POST /upload HTTP/1.1\r\nHost: gw\r\nConnection: close\r\nContent-Length: 10\r\n\r\n0123456789";
    let (reply, _) = raw_exchange(gw.addr, complete, Duration::from_secs(5)).await.unwrap();
    assert!(reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(reply.contains("got 10 bytes"), "{reply}");

    let stalled = b"POST /upload HTTP/1.1\r\nHost: gw\r\nConnection: close\r\nContent-Length: 100\r\n\r\n0123456789";
    let (reply, elapsed) = raw_exchange(gw.addr, stalled, Duration::from_secs(5))
        .await
        .expect("connection should close once the read timeout passes");
    assert!(!reply.starts_with("HTTP/1.1 200"), "{reply}");
    assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
}

#[tokio::test]
async fn read_header_timeout_closes_a_stalled_connection() {
    let opts = ServerOptions::new().read_header_timeout(Duration::from_millis(300));
    let gw = gateway(r#"{{ HandleFunc "/ok" (Text 200 "OK") }}"#, &[], opts).await;

    let partial = b"GET /ok HTTP/1.1\r\nHost: gw\r\nX-Slow: 1\r\n";
    let (reply, elapsed) = raw_exchange(gw.addr, partial, Duration::from_secs(5))
        .await
        .expect("connection should close once the header timeout passes");
    assert!(!reply.contains("200 OK"), "{reply}");
    assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
}

#[tokio::test]
async fn invalid_configuration_never_listens() {
    let server = revproxy::Server::new(ServerOptions::new().listen_addr("127.0.0.1:0"));
    let err = server.start(r#"{{ HandleFunc "/x" (Text 1000 "x") }}"#, Default::default()).await;
    assert!(matches!(err, Err(revproxy::Error::Eval(_))));
    assert_eq!(server.ready().await, None);
}
