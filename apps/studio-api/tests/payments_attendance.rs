use chrono::{DateTime, Months, Utc};
use http::StatusCode;
use serde_json::{Value, json};

mod common;
use common::setup_test_app;

fn timestamp(value: &Value) -> DateTime<Utc> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .expect("RFC 3339 timestamp")
}

#[tokio::test]
async fn test_payment_is_priced_from_the_package_and_carries_a_receipt() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (user, user_token) = app.student_of("Uma", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;
    let class_id = class["id"].as_str().unwrap();

    let quarter = app.pay(&user_token, class_id, "3month").await;
    assert_eq!(quarter["status"], "completed");
    assert_eq!(quarter["amount"], 100.0);
    assert_eq!(quarter["user_id"], user.id.as_str());
    assert!(quarter["receipt_number"].as_str().unwrap().starts_with("RCPT-"));
    assert!(quarter["transaction_id"].as_str().unwrap().starts_with("TXN-"));
    let from = timestamp(&quarter["valid_from"]);
    assert_eq!(
        timestamp(&quarter["valid_until"]),
        from.checked_add_months(Months::new(3)).unwrap()
    );

    let year = app.pay(&user_token, class_id, "1year").await;
    assert_eq!(year["amount"], 350.0);
    let from = timestamp(&year["valid_from"]);
    assert_eq!(
        timestamp(&year["valid_until"]),
        from.checked_add_months(Months::new(12)).unwrap()
    );
    assert_ne!(quarter["receipt_number"], year["receipt_number"]);

    let payments = app
        .server
        .get("/api/payments")
        .authorization_bearer(&user_token)
        .await
        .json::<Vec<Value>>();
    assert_eq!(payments.len(), 2);
}

#[tokio::test]
async fn test_payment_validation() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (_, user_token) = app.student_of("Uma", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;

    let unknown_class = app
        .server
        .post("/api/payments")
        .authorization_bearer(&user_token)
        .json(&json!({ "class_id": "missing", "package_type": "3month", "payment_method": "card" }))
        .await;
    unknown_class.assert_status(StatusCode::NOT_FOUND);

    let no_method = app
        .server
        .post("/api/payments")
        .authorization_bearer(&user_token)
        .json(&json!({ "class_id": class["id"], "package_type": "3month", "payment_method": " " }))
        .await;
    no_method.assert_status(StatusCode::BAD_REQUEST);

    app.server
        .post("/api/payments")
        .authorization_bearer(&admin_token)
        .json(&json!({ "class_id": class["id"], "package_type": "3month", "payment_method": "card" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_receipt_is_owner_scoped() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (_, owner_token) = app.student_of("Uma", &admin).await;
    let (_, other_token) = app.student_of("Omar", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;
    let payment = app
        .pay(&owner_token, class["id"].as_str().unwrap(), "3month")
        .await;
    let path = format!("/api/payments/receipt/{}", payment["id"].as_str().unwrap());

    let own = app.server.get(&path).authorization_bearer(&owner_token).await;
    own.assert_status_ok();
    assert_eq!(own.json::<Value>()["receipt_number"], payment["receipt_number"]);

    app.server
        .get(&path)
        .authorization_bearer(&other_token)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_marking_twice_on_one_day_keeps_a_single_record() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (user, user_token) = app.student_of("Uma", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;
    let class_id = class["id"].as_str().unwrap();

    let first = app
        .server
        .post("/api/attendance")
        .authorization_bearer(&admin_token)
        .json(&json!({
            "user_id": user.id,
            "class_id": class_id,
            "date": "2024-02-01T18:00:00Z",
            "status": "present"
        }))
        .await;
    first.assert_status_ok();
    let first = first.json::<Value>();

    let second = app
        .server
        .post("/api/attendance")
        .authorization_bearer(&admin_token)
        .json(&json!({
            "user_id": user.id,
            "class_id": class_id,
            "date": "2024-02-01T20:30:00Z",
            "status": "absent"
        }))
        .await;
    second.assert_status_ok();
    let second = second.json::<Value>();
    assert_eq!(second["id"], first["id"]);
    assert_eq!(second["status"], "absent");

    let records = app
        .server
        .get(&format!("/api/attendance/class/{class_id}"))
        .authorization_bearer(&admin_token)
        .await
        .json::<Vec<Value>>();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["day"], "2024-02-01");
    assert_eq!(records[0]["status"], "absent");

    let mine = app
        .server
        .get("/api/attendance/me")
        .authorization_bearer(&user_token)
        .await
        .json::<Vec<Value>>();
    assert_eq!(mine.len(), 1);
}

#[tokio::test]
async fn test_attendance_stats() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (user, _) = app.student_of("Uma", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;
    let stats_path = format!("/api/attendance/stats/{}", user.id);

    let empty = app
        .server
        .get(&stats_path)
        .authorization_bearer(&admin_token)
        .await
        .json::<Value>();
    assert_eq!(empty["total_classes"], 0);
    assert_eq!(empty["attendance_rate"], 0.0);

    for (day, status) in [
        ("2024-03-01", "present"),
        ("2024-03-02", "present"),
        ("2024-03-03", "absent"),
    ] {
        app.server
            .post("/api/attendance")
            .authorization_bearer(&admin_token)
            .json(&json!({
                "user_id": user.id,
                "class_id": class["id"],
                "date": format!("{day}T18:00:00Z"),
                "status": status
            }))
            .await
            .assert_status_ok();
    }

    let stats = app
        .server
        .get(&stats_path)
        .authorization_bearer(&admin_token)
        .await
        .json::<Value>();
    assert_eq!(stats["total_classes"], 3);
    assert_eq!(stats["present"], 2);
    assert_eq!(stats["absent"], 1);
    assert_eq!(stats["attendance_rate"], 66.67);

    let history = app
        .server
        .get(&format!("/api/attendance/user/{}", user.id))
        .authorization_bearer(&admin_token)
        .await
        .json::<Vec<Value>>();
    assert_eq!(history.len(), 3);
}

#[tokio::test]
async fn test_attendance_requires_known_class_and_user() {
    let app = setup_test_app();
    let (admin, admin_token) = app.admin("Rita").await;
    let (user, user_token) = app.student_of("Uma", &admin).await;
    let class = app.create_class(&admin_token, "Salsa").await;

    app.server
        .post("/api/attendance")
        .authorization_bearer(&admin_token)
        .json(&json!({ "user_id": user.id, "class_id": "missing", "status": "present" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    app.server
        .post("/api/attendance")
        .authorization_bearer(&admin_token)
        .json(&json!({ "user_id": "ghost", "class_id": class["id"], "status": "present" }))
        .await
        .assert_status(StatusCode::NOT_FOUND);
    app.server
        .post("/api/attendance")
        .authorization_bearer(&user_token)
        .json(&json!({ "user_id": user.id, "class_id": class["id"], "status": "present" }))
        .await
        .assert_status(StatusCode::FORBIDDEN);
    app.server
        .get("/api/attendance/class/missing")
        .authorization_bearer(&admin_token)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}
