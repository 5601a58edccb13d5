#![allow(dead_code)]

use axum_test::TestServer;
use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use studio_api::application::middleware::{AuthenticatedUser, session_key};
use studio_api::{AppConfig, AppState, create_app};
use studio_core::{
    Cache, EventPublisher,
    adapters::{InMemoryCache, InMemoryConnector, InMemoryEventBus},
    domain::payment::ReceiptIssuer,
    domain::user::{Role, User},
    tenancy::ConnectionRegistry,
};
use uuid::Uuid;

pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
}

// Helper function to set up the test application with in-memory dependencies
pub fn setup_test_app() -> TestApp {
    let registry = Arc::new(
        ConnectionRegistry::new("studio", Arc::new(InMemoryConnector::default()))
            .expect("valid prefix"),
    );
    let cache: Arc<dyn Cache> = Arc::new(InMemoryCache::default());
    let event_bus: Arc<dyn EventPublisher> = Arc::new(InMemoryEventBus::default());

    let state = AppState {
        registry,
        cache,
        event_bus,
        receipts: Arc::new(ReceiptIssuer::new("RCPT")),
        config: Arc::new(AppConfig::default()),
    };
    let server = TestServer::new(create_app(state.clone())).expect("Failed to create TestServer");
    TestApp { server, state }
}

impl TestApp {
    /// Writes a principal straight into the directory and opens a session for
    /// it, skipping the password hashing of the register/login routes.
    pub async fn principal(&self, name: &str, role: Role, admin: Option<&User>) -> (User, String) {
        let email = format!("{}-{}@studio.test", name.to_lowercase(), Uuid::new_v4());
        let mut user = User::register(name, &email, "unused-hash".into(), role, Utc::now())
            .expect("valid user");
        user.admin_id = admin.map(|a| a.id.clone());

        let directory = self.state.registry.main().await.unwrap();
        let user = directory.insert_user(user).await.unwrap();
        let token = self.session(&user).await;
        (user, token)
    }

    pub async fn admin(&self, name: &str) -> (User, String) {
        self.principal(name, Role::Admin, None).await
    }

    pub async fn student_of(&self, name: &str, admin: &User) -> (User, String) {
        self.principal(name, Role::User, Some(admin)).await
    }

    pub async fn session(&self, user: &User) -> String {
        let token = Uuid::new_v4().to_string();
        let session = AuthenticatedUser {
            user_id: user.id.clone(),
            role: user.role,
        };
        self.state
            .cache
            .set(
                &session_key(&token),
                &serde_json::to_vec(&session).unwrap(),
                None,
            )
            .await
            .unwrap();
        token
    }

    pub async fn directory_user(&self, user_id: &str) -> Option<User> {
        let directory = self.state.registry.main().await.unwrap();
        directory.get_user(user_id).await.unwrap()
    }

    /// Creates an offline class priced 100 (3 months) / 350 (1 year).
    pub async fn create_class(&self, admin_token: &str, name: &str) -> Value {
        let response = self
            .server
            .post("/api/classes")
            .authorization_bearer(admin_token)
            .json(&class_body(name))
            .await;
        response.assert_status(http::StatusCode::CREATED);
        response.json::<Value>()
    }

    pub async fn request_class(&self, user_token: &str, class_id: &str, package: &str) -> Value {
        let response = self
            .server
            .post(&format!("/api/classes/{class_id}/request"))
            .authorization_bearer(user_token)
            .json(&json!({ "package_type": package }))
            .await;
        response.assert_status(http::StatusCode::CREATED);
        response.json::<Value>()
    }

    pub async fn pay(&self, user_token: &str, class_id: &str, package: &str) -> Value {
        let response = self
            .server
            .post("/api/payments")
            .authorization_bearer(user_token)
            .json(&json!({
                "class_id": class_id,
                "package_type": package,
                "payment_method": "card",
            }))
            .await;
        response.assert_status(http::StatusCode::CREATED);
        response.json::<Value>()
    }

    pub async fn notifications(&self, token: &str) -> Vec<Value> {
        self.server
            .get("/api/notifications")
            .authorization_bearer(token)
            .await
            .json::<Vec<Value>>()
    }

    pub async fn get_class(&self, admin_token: &str, class_id: &str) -> Value {
        let classes = self
            .server
            .get("/api/classes")
            .authorization_bearer(admin_token)
            .await
            .json::<Vec<Value>>();
        classes
            .into_iter()
            .find(|c| c["id"] == class_id)
            .expect("class is listed")
    }
}

pub fn class_body(name: &str) -> Value {
    json!({
        "name": name,
        "description": "Weekly group class",
        "instructor": "Rita",
        "schedule": { "days": ["Monday", "Thursday"], "time": "18:00", "duration": 60 },
        "capacity": 12,
        "mode": "offline",
        "location": "Studio 1",
        "packages": [
            { "type": "3month", "price": 100.0 },
            { "type": "1year", "price": 350.0 }
        ]
    })
}

pub fn kinds(notifications: &[Value]) -> Vec<&str> {
    notifications
        .iter()
        .filter_map(|n| n["type"].as_str())
        .collect()
}
