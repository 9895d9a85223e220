//! The REST surface driven over a real socket.

#![allow(clippy::unwrap_used)]

use mailroom::api::{AppState, router};
use mailroom_core::pipeline::create_topics;
use mailroom_core::service::AuthConfig;
use mailroom_core::{Database, Notifier};
use mailroom_queue::Broker;
use reqwest::{Client, Response, StatusCode};
use serde_json::{Value, json};

struct Server {
    base: String,
    http: Client,
}

impl Server {
    async fn start() -> Self {
        let db = Database::in_memory().await.unwrap();
        let broker = Broker::in_memory().await.unwrap();
        create_topics(&broker, 1).await.unwrap();
        let auth = AuthConfig {
            password_memory_kib: 64,
            password_iterations: 1,
            ..AuthConfig::default()
        };
        let state = AppState::new(&db, broker, Notifier::new(), auth).unwrap();
        let app = router(state, 1024 * 1024);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{addr}"),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    /// Registers and logs in; returns the bearer token.
    async fn user(&self, email: &str) -> String {
        let res = self
            .http
            .post(self.url("/api/auth/register"))
            .json(&json!({ "email": email, "password": "correct horse", "display_name": "T" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let res = self
            .http
            .post(self.url("/api/auth/login"))
            .json(&json!({ "email": email, "password": "correct horse" }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let session: Value = res.json().await.unwrap();
        session["token"].as_str().unwrap().to_string()
    }

    async fn get(&self, token: &str, path: &str) -> Response {
        self.http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> Response {
        self.http
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }
}

async fn error_code(res: Response) -> String {
    let body: Value = res.json().await.unwrap();
    body["error"]["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn register_login_and_identify() {
    let server = Server::start().await;
    let token = server.user("ada@example.com").await;

    let res = server.get(&token, "/api/auth/me").await;
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().contains_key("x-request-id"));
    let me: Value = res.json().await.unwrap();
    assert_eq!(me["email"], "ada@example.com");
    assert!(me.get("password_hash").is_none());

    let res = server
        .http
        .post(server.url("/api/auth/register"))
        .json(&json!({ "email": "ADA@example.com", "password": "another one" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    assert_eq!(error_code(res).await, "conflict");

    let res = server
        .http
        .post(server.url("/api/auth/login"))
        .json(&json!({ "email": "ada@example.com", "password": "wrong password" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = server
        .http
        .post(server.url("/api/auth/logout"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let res = server.get(&token, "/api/auth/me").await;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn requests_without_a_token_are_refused() {
    let server = Server::start().await;
    let res = server
        .http
        .get(server.url("/api/emails"))
        .header("x-request-id", "trace-me")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.headers()["x-request-id"], "trace-me");
    assert_eq!(error_code(res).await, "unauthorized");
}

#[tokio::test]
async fn malformed_input_is_a_validation_error() {
    let server = Server::start().await;
    let token = server.user("ada@example.com").await;

    let res = server
        .http
        .post(server.url("/api/emails"))
        .bearer_auth(&token)
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(res).await, "validation_failed");

    let res = server.get(&token, "/api/emails/abc").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = server.get(&token, "/api/emails/999").await;
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(res).await, "not_found");
}

#[tokio::test]
async fn draft_attachment_and_send() {
    let server = Server::start().await;
    let ada = server.user("ada@example.com").await;
    let eve = server.user("eve@example.com").await;

    let res = server
        .post(
            &ada,
            "/api/emails",
            json!({
                "to": ["Bob <bob@example.org>"],
                "subject": "Figures",
                "body_text": "See attached.",
                "attachments": [
                    { "filename": "figures.txt", "content_type": "text/plain", "content": "aGVsbG8=" }
                ]
            }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let draft: Value = res.json().await.unwrap();
    assert_eq!(draft["status"], "draft");
    assert_eq!(draft["folder"], "drafts");
    let id = draft["id"].as_i64().unwrap();
    let attachment = draft["attachments"][0]["id"].as_i64().unwrap();

    let res = server.get(&ada, "/api/emails?folder=drafts").await;
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 1);

    let res = server
        .get(&ada, &format!("/api/emails/{id}/attachments/{attachment}"))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "text/plain");
    assert!(
        res.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains("figures.txt")
    );
    assert_eq!(res.bytes().await.unwrap().as_ref(), b"hello");

    // Someone else's email.
    let res = server.get(&eve, &format!("/api/emails/{id}")).await;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    let res = server
        .post(&ada, &format!("/api/emails/{id}/send"), json!({}))
        .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let sent: Value = res.json().await.unwrap();
    assert_eq!(sent["status"], "queued");

    // Sending again only re-announces the queued email.
    let res = server
        .post(&ada, &format!("/api/emails/{id}/send"), json!({}))
        .await;
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    assert_eq!(res.json::<Value>().await.unwrap()["status"], "queued");
}

#[tokio::test]
async fn labels_and_templates() {
    let server = Server::start().await;
    let ada = server.user("ada@example.com").await;

    let res = server
        .post(&ada, "/api/labels", json!({ "name": "Work", "color": "#336699" }))
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let label = res.json::<Value>().await.unwrap()["id"].as_i64().unwrap();
    let res = server
        .post(&ada, "/api/labels", json!({ "name": "work" }))
        .await;
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = server
        .post(
            &ada,
            "/api/templates",
            json!({ "name": "Welcome", "subject": "Hello {{ name }}", "body_text": "Hi {{name}}!" }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let template = res.json::<Value>().await.unwrap()["id"].as_i64().unwrap();

    let res = server
        .post(
            &ada,
            &format!("/api/templates/{template}/compose"),
            json!({ "to": ["bob@example.org"], "vars": { "name": "Bob" } }),
        )
        .await;
    assert_eq!(res.status(), StatusCode::CREATED);
    let draft: Value = res.json().await.unwrap();
    assert_eq!(draft["subject"], "Hello Bob");
    let id = draft["id"].as_i64().unwrap();

    let res = server
        .post(&ada, &format!("/api/emails/{id}/labels/{label}"), json!({}))
        .await;
    assert_eq!(res.status(), StatusCode::OK);
    let labelled: Value = res.json().await.unwrap();
    assert_eq!(labelled["labels"][0]["name"], "Work");

    let res = server
        .get(&ada, &format!("/api/emails?label={label}"))
        .await;
    let page: Value = res.json().await.unwrap();
    assert_eq!(page["total"], 1);
    assert_eq!(page["items"][0]["id"], id);
}

#[tokio::test]
async fn settings_and_analytics() {
    let server = Server::start().await;
    let ada = server.user("ada@example.com").await;

    let res = server
        .http
        .put(server.url("/api/users/me/settings"))
        .bearer_auth(&ada)
        .json(&json!({ "page_size": 25, "signature": "-- Ada" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let settings: Value = res.json().await.unwrap();
    assert_eq!(settings["page_size"], 25);

    let res = server
        .http
        .put(server.url("/api/users/me/settings"))
        .bearer_auth(&ada)
        .json(&json!({ "page_size": 0 }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = server.get(&ada, "/api/users/me/analytics").await;
    assert_eq!(res.status(), StatusCode::OK);
    let res = server.get(&ada, "/api/users/me/analytics?days=0").await;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_and_queue_stats() {
    let server = Server::start().await;
    let res = server.http.get(server.url("/healthz")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await.unwrap()["status"], "ok");

    let res = server
        .http
        .get(server.url("/api/queue/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let ada = server.user("ada@example.com").await;
    let res = server.get(&ada, "/api/queue/stats").await;
    assert_eq!(res.status(), StatusCode::OK);
    let stats: Value = res.json().await.unwrap();
    let topics: Vec<&str> = stats
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["topic"].as_str().unwrap())
        .collect();
    assert_eq!(
        topics,
        [
            "email-send",
            "email-send.retry",
            "email-send.dlq",
            "email-receive",
            "email-receive.retry",
            "email-receive.dlq"
        ]
    );
}
