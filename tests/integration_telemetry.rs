use backend_supervisor::{
    telemetry::TelemetryProtocol, Dstm, ReadStatus, TelemetryClient, TelemetryConfig, XmrigAmd,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Accept one connection, read the request, write `response` and then hold
/// the connection open for `linger`
async fn serve_once(response: &'static [u8], linger: Duration) -> (u16, tokio::task::JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = vec![0u8; 1024];
        let n = socket.read(&mut request).await.unwrap();
        request.truncate(n);
        socket.write_all(response).await.unwrap();
        tokio::time::sleep(linger).await;
        request
    });
    (port, handle)
}

fn client(read_timeout: Duration) -> TelemetryClient {
    TelemetryClient::new(TelemetryConfig {
        read_timeout,
        ..TelemetryConfig::default()
    })
}

#[tokio::test]
async fn xmrig_http_summary() {
    let response: &'static [u8] = b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n\r\n{\n    \"hashrate\": {\n        \"total\": [812.4, 798.0, null],\n        \"highest\": 830.1\n    }\n}";
    // Held open: only the end-of-message rule can finish the read in time
    let (port, server) = serve_once(response, Duration::from_secs(10)).await;

    let started = std::time::Instant::now();
    let sample = client(Duration::from_secs(5)).poll(port, &XmrigAmd::default()).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(sample.status, ReadStatus::GotRead);
    assert_eq!(sample.speed, 812.4);

    server.abort();
}

#[tokio::test]
async fn dstm_request_is_getstat() {
    let (port, server) = serve_once(b"{\"result\":[{\"sol_ps\":1.5}]}\n", Duration::ZERO).await;

    let sample = client(Duration::from_secs(2)).poll(port, &Dstm).await;
    assert_eq!(sample.status, ReadStatus::GotRead);

    let request = server.await.unwrap();
    assert_eq!(request, Dstm.request());
    let json: serde_json::Value = serde_json::from_slice(&request).unwrap();
    assert_eq!(json["method"], "getstat");
}

#[tokio::test]
async fn partial_response_parsed_after_timeout() {
    // Valid JSON but no trailing newline, so the heuristic never matches
    let (port, server) = serve_once(b"{\"result\":[{\"sol_ps\":2.0}]}", Duration::from_secs(10)).await;

    let sample = client(Duration::from_millis(300)).poll(port, &Dstm).await;
    assert_eq!(sample.status, ReadStatus::GotRead);
    assert_eq!(sample.speed, 2.0);

    server.abort();
}

#[tokio::test]
async fn silent_backend_yields_none() {
    let (port, server) = serve_once(b"", Duration::from_secs(10)).await;

    let started = std::time::Instant::now();
    let sample = client(Duration::from_millis(300)).poll(port, &Dstm).await;
    assert_eq!(sample.status, ReadStatus::None);
    assert!(started.elapsed() < Duration::from_secs(3));

    server.abort();
}

#[tokio::test]
async fn malformed_response_yields_none() {
    let (port, _server) = serve_once(b"<html>busy</html>}\n", Duration::ZERO).await;

    let sample = client(Duration::from_secs(2)).poll(port, &Dstm).await;
    assert_eq!(sample.status, ReadStatus::None);
    assert_eq!(sample.speed, 0.0);
}
