//! Integration tests for the challenge server over real HTTP.
//!
//! Each test spins up the Axum server on a random port and drives it with
//! reqwest, the way an operator's browser or script would.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;

use code_relay::server::challenge_routes;
use code_relay::session::{ChallengeSession, CodeSource, SessionOutcome, SessionState};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Start the challenge server on a random port, return (base url, session).
async fn start_server(session_timeout: Duration) -> (String, Arc<ChallengeSession>) {
    let session = ChallengeSession::new(session_timeout);
    let app = challenge_routes(Arc::clone(&session), 6);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), session)
}

async fn post(client: &reqwest::Client, url: String, body: Option<Value>) -> (u16, Value) {
    let mut req = client.post(url);
    if let Some(body) = body {
        req = req.json(&body);
    }
    let resp = req.send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

async fn get(client: &reqwest::Client, url: String) -> (u16, Value) {
    let resp = client.get(url).send().await.unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn human_submits_within_window() {
    timeout(TEST_TIMEOUT, async {
        let (base, session) = start_server(Duration::from_secs(1800)).await;
        let client = reqwest::Client::new();

        let (status, started) = post(&client, format!("{base}/start"), None).await;
        assert_eq!(status, 200);
        assert!(started["session_id"].is_string());

        let (_, waiting) = get(&client, format!("{base}/status")).await;
        assert_eq!(waiting["waiting_for_code"], true);
        assert_eq!(waiting["has_code"], false);
        assert_eq!(waiting["state"], "listening");

        let (status, submitted) = post(
            &client,
            format!("{base}/submit"),
            Some(json!({ "verificationId": "441353" })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(submitted["success"], true);
        assert_eq!(submitted["verificationId"], "441353");

        let (_, after) = get(&client, format!("{base}/status")).await;
        assert_eq!(after["has_code"], true);
        assert_eq!(after["waiting_for_code"], false);
        assert!(after["code_received_time"].is_string());
        assert!(!after.to_string().contains("441353"));

        // The read consumed the result.
        let (_, again) = get(&client, format!("{base}/status")).await;
        assert_eq!(again["has_code"], false);
        assert_eq!(again["state"], "idle");
        assert_eq!(session.snapshot().state, SessionState::Idle);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn late_submit_is_gone() {
    timeout(TEST_TIMEOUT, async {
        let (base, session) = start_server(Duration::from_millis(100)).await;
        let client = reqwest::Client::new();

        let (status, _) = post(&client, format!("{base}/start"), None).await;
        assert_eq!(status, 200);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(session.snapshot().state, SessionState::TimedOut);

        let (status, body) = post(
            &client,
            format!("{base}/submit"),
            Some(json!({ "verificationId": "441353" })),
        )
        .await;
        assert_eq!(status, 409);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "gone");

        let (_, snapshot) = get(&client, format!("{base}/status")).await;
        assert_eq!(snapshot["state"], "timed_out");
        assert_eq!(snapshot["has_code"], false);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn code_is_not_accepted_after_stop() {
    timeout(TEST_TIMEOUT, async {
        let (base, session) = start_server(Duration::from_secs(1800)).await;
        let client = reqwest::Client::new();

        post(&client, format!("{base}/start"), None).await;
        let (status, body) = post(&client, format!("{base}/stop"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body, json!({}));

        let (status, body) = post(
            &client,
            format!("{base}/submit"),
            Some(json!({ "verificationId": "441353" })),
        )
        .await;
        assert_eq!(status, 409);
        assert_eq!(body["message"], "Not currently waiting");
        assert_eq!(session.snapshot().state, SessionState::Idle);

        // A fresh session can start right away.
        let (status, _) = post(&client, format!("{base}/start"), None).await;
        assert_eq!(status, 200);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn concurrent_submits_accept_exactly_one() {
    timeout(TEST_TIMEOUT, async {
        let (base, session) = start_server(Duration::from_secs(1800)).await;
        let client = reqwest::Client::new();
        let ticket = session.start().unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            let url = format!("{base}/submit");
            handles.push(tokio::spawn(async move {
                let code = format!("{:06}", 100_000 + i);
                post(&client, url, Some(json!({ "verificationId": code }))).await.0
            }));
        }

        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                200 => accepted += 1,
                409 => {}
                other => panic!("unexpected status {other}"),
            }
        }
        assert_eq!(accepted, 1);

        let received = ticket.code.await.unwrap();
        assert_eq!(received.source, CodeSource::Human);
        assert!(matches!(
            session.consume(ticket.session_id),
            Some(SessionOutcome::Received(_))
        ));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn health_answers_ok() {
    timeout(TEST_TIMEOUT, async {
        let (base, _) = start_server(Duration::from_secs(1800)).await;
        let (status, body) = get(&reqwest::Client::new(), format!("{base}/health")).await;
        assert_eq!(status, 200);
        assert_eq!(body["status"], "ok");
    })
    .await
    .expect("test timed out");
}
