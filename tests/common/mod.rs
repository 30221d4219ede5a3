// Shared harness: a real server on an ephemeral port backed by a temp database.
#![allow(dead_code)]

use std::time::Duration;

use agora::config::Config;
use agora::routes;
use agora::state::AppState;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use tempfile::TempDir;

pub struct TestServer {
    pub base: String,
    pub client: Client,
    pub state: AppState,
    _tmp: TempDir,
}

/// A registered account with the session registration opened.
pub struct TestUser {
    pub id: i64,
    pub token: String,
}

pub async fn spawn() -> TestServer {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::default();
    config.auth.bcrypt_cost = 4;
    config.resolve_paths(tmp.path());

    let state = AppState::initialize(config).unwrap();
    let app = routes::app(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        base: format!("http://{}", addr),
        client: Client::new(),
        state,
        _tmp: tmp,
    }
}

impl TestServer {
    pub fn request(&self, method: Method, path: &str, user: Option<&TestUser>) -> RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base, path));
        match user {
            Some(user) => builder.bearer_auth(&user.token),
            None => builder,
        }
    }

    pub async fn get(&self, path: &str, user: Option<&TestUser>) -> Response {
        self.request(Method::GET, path, user).send().await.unwrap()
    }

    pub async fn post(&self, path: &str, user: Option<&TestUser>, body: Value) -> Response {
        self.request(Method::POST, path, user)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    pub async fn get_json(&self, path: &str, user: Option<&TestUser>) -> Value {
        let res = self.get(path, user).await;
        assert_eq!(res.status(), StatusCode::OK, "GET {}", path);
        res.json().await.unwrap()
    }

    pub async fn post_json(&self, path: &str, user: Option<&TestUser>, body: Value) -> Value {
        let res = self.post(path, user, body).await;
        assert!(res.status().is_success(), "POST {} -> {}", path, res.status());
        res.json().await.unwrap()
    }

    pub async fn register(&self, name: &str, private: bool) -> TestUser {
        let res = self
            .post(
                "/register",
                None,
                json!({
                    "email": format!("{}@example.com", name),
                    "password": "hunter22",
                    "first_name": name,
                    "last_name": "Tester",
                    "nickname": name,
                    "private": private,
                }),
            )
            .await;
        assert_eq!(res.status(), StatusCode::CREATED);
        let body: Value = res.json().await.unwrap();
        TestUser {
            id: body["user"]["id"].as_i64().unwrap(),
            token: body["token"].as_str().unwrap().to_string(),
        }
    }

    pub async fn create_group(&self, owner: &TestUser, name: &str, access: &str) -> i64 {
        self.post_json(
            "/group",
            Some(owner),
            json!({ "name": name, "description": "test group", "access": access }),
        )
        .await["id"]
            .as_i64()
            .unwrap()
    }

    /// Notifications of `kind` in the user's inbox.
    pub async fn notifications_of(&self, user: &TestUser, kind: &str) -> Vec<Value> {
        let all = self.get_json("/notifications", Some(user)).await;
        all.as_array()
            .unwrap()
            .iter()
            .filter(|n| n["kind"] == kind)
            .cloned()
            .collect()
    }

    /// Delivery is asynchronous; wait until at least `count` have landed.
    pub async fn wait_for_notifications(
        &self,
        user: &TestUser,
        kind: &str,
        count: usize,
    ) -> Vec<Value> {
        for _ in 0..100 {
            let found = self.notifications_of(user, kind).await;
            if found.len() >= count {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.notifications_of(user, kind).await
    }

    /// Waits for the notification queue to go quiet so absent rows can be asserted.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
