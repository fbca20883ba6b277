//! Drives the reqwest clients against a local axum backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Form, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::{json, Value};
use travel_booking_client::{
    ApiClient, BookingController, BookingId, BookingStatus, CardDetails, CheckoutRequest,
    ClientConfig, Contact, CredentialStore, ErrorKind, HttpCardProcessor, LoginRequest,
    MemoryStorage, PackageId, PaymentCoordinator, PaymentStatus, Role, SessionExpiryHandler,
    SessionReconciler, SessionStatus,
};
use url::Url;

#[derive(Default)]
struct Backend {
    cancels: AtomicUsize,
    confirms: AtomicUsize,
}

type Shared = Arc<Backend>;

const TOKEN: &str = "t-good";

fn user_json(role: &str) -> Value {
    json!({ "_id": "u1", "name": "Ana", "email": "ana@example.com", "role": role })
}

fn booking_json(id: &str, status: &str) -> Value {
    json!({
        "_id": id,
        "user": "u1",
        "package": "pkg-1",
        "status": status,
        "paymentStatus": "unpaid",
        "totalAmount": 1200,
        "bookingDate": "2024-05-01T10:00:00.000Z"
    })
}

fn authorized(headers: &HeaderMap) -> Result<(), (StatusCode, Json<Value>)> {
    let expected = format!("Bearer {TOKEN}");
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(v) if v == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Not authorized, token failed" })),
        )),
    }
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    match body["password"].as_str() {
        Some("secret") => (
            StatusCode::OK,
            Json(json!({ "token": TOKEN, "user": user_json("user") })),
        ),
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "Invalid email or password" })),
        ),
    }
}

async fn admin_login() -> Json<Value> {
    // Server hands out a token even though the account is not an admin.
    Json(json!({ "token": TOKEN, "user": user_json("user") }))
}

async fn me(headers: HeaderMap) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorized(&headers)?;
    Ok(Json(json!({ "user": user_json("user") })))
}

async fn bookings(headers: HeaderMap) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorized(&headers)?;
    Ok(Json(json!({
        "bookings": [booking_json("b1", "pending"), booking_json("b2", "confirmed")]
    })))
}

async fn cancel(
    State(state): State<Shared>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorized(&headers)?;
    state.cancels.fetch_add(1, Ordering::SeqCst);
    if id == "b2" {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "Booking can no longer be cancelled" })),
        ));
    }
    Ok(Json(json!({ "success": true })))
}

async fn create_intent(
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorized(&headers)?;
    if body["packageId"] != "pkg-1" || body["travelers"] != 2 {
        return Err((StatusCode::BAD_REQUEST, Json(json!({ "message": "bad request" }))));
    }
    Ok(Json(json!({ "clientSecret": "pi_42_secret_s", "bookingId": "b9" })))
}

async fn confirm(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    authorized(&headers)?;
    state.confirms.fetch_add(1, Ordering::SeqCst);
    assert_eq!(body["paymentIntentId"], "pi_42");
    assert_eq!(body["bookingId"], "b9");
    Ok(Json(json!({ "payment": { "_id": "pay-9" } })))
}

async fn payment_method(Form(form): Form<Vec<(String, String)>>) -> (StatusCode, Json<Value>) {
    let number = form
        .iter()
        .find(|(k, _)| k == "card[number]")
        .map(|(_, v)| v.as_str());
    match number {
        Some("4000000000000002") => (
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({ "error": { "message": "Your card was declined.", "code": "card_declined" } })),
        ),
        _ => (StatusCode::OK, Json(json!({ "id": "pm_1", "object": "payment_method" }))),
    }
}

async fn confirm_intent(Path(id): Path<String>) -> Json<Value> {
    Json(json!({ "id": id, "object": "payment_intent", "status": "succeeded" }))
}

async fn spawn_backend() -> (Url, Shared) {
    let state = Shared::default();
    let router = Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/admin/login", post(admin_login))
        .route("/api/auth/me", get(me))
        .route("/api/auth/bookings", get(bookings))
        .route("/api/bookings/{id}/cancel", put(cancel))
        .route("/api/payments/create-payment-intent", post(create_intent))
        .route("/api/payments/confirm", post(confirm))
        .route("/v1/payment_methods", post(payment_method))
        .route("/v1/payment_intents/{id}/confirm", post(confirm_intent))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (format!("http://{addr}/").parse().unwrap(), state)
}

fn config(base: &Url) -> ClientConfig {
    ClientConfig::new(base.join("api").unwrap())
        .with_processor_url(base.clone())
        .with_processor_key("pk_test_1")
}

fn reconciler(config: &ClientConfig) -> Arc<SessionReconciler<ApiClient>> {
    let credentials = CredentialStore::new(MemoryStorage::default());
    let api = ApiClient::new(config, credentials.bearer()).unwrap();
    Arc::new(SessionReconciler::new(api, credentials))
}

#[tokio::test]
async fn login_attaches_bearer_to_following_requests() {
    let (base, _) = spawn_backend().await;
    let session = reconciler(&config(&base));

    let user = session
        .login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap();
    assert_eq!(user.role, Role::User);
    // The refresh after login only succeeds if the bearer was attached.
    assert_eq!(session.status(), SessionStatus::Authenticated);
    assert_eq!(session.session().last_error, None);
}

#[tokio::test]
async fn bad_password_is_unauthorized_not_expired() {
    let (base, _) = spawn_backend().await;
    let session = reconciler(&config(&base));

    let err = session
        .login(&LoginRequest::new("ana@example.com", "nope"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert!(err.to_string().contains("Invalid email or password"));
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
}

#[tokio::test]
async fn admin_login_with_user_account_is_refused() {
    let (base, _) = spawn_backend().await;
    let session = reconciler(&config(&base));

    let err = session
        .admin_login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthorized);
    assert_eq!(session.status(), SessionStatus::Unauthenticated);
    assert!(!session.credentials().bearer().is_set());
}

#[tokio::test]
async fn rejected_stored_token_logs_out_on_restore() {
    let (base, _) = spawn_backend().await;
    let config = config(&base);
    let credentials = CredentialStore::new(MemoryStorage::default());
    credentials
        .save(
            &travel_booking_client::Token::new("t-stale"),
            &serde_json::from_value(user_json("user")).unwrap(),
            false,
        )
        .unwrap();
    let api = ApiClient::new(&config, credentials.bearer()).unwrap();
    let session = SessionReconciler::new(api, credentials);

    assert_eq!(session.restore().await, SessionStatus::Unauthenticated);
    assert_eq!(session.session().last_error, Some(ErrorKind::SessionExpired));
    assert_eq!(session.credentials().read().token, None);
}

#[tokio::test]
async fn unreachable_backend_keeps_cached_session() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = ClientConfig::new(format!("http://{addr}/api/").parse().unwrap());
    let credentials = CredentialStore::new(MemoryStorage::default());
    credentials
        .save(
            &travel_booking_client::Token::new(TOKEN),
            &serde_json::from_value(user_json("user")).unwrap(),
            false,
        )
        .unwrap();
    let api = ApiClient::new(&config, credentials.bearer()).unwrap();
    let session = SessionReconciler::new(api, credentials);

    assert_eq!(session.restore().await, SessionStatus::Authenticated);
    assert_eq!(
        session.session().last_error,
        Some(ErrorKind::NetworkUnreachable)
    );
}

#[tokio::test]
async fn booking_cancel_round_trip() {
    let (base, state) = spawn_backend().await;
    let config = config(&base);
    let session = reconciler(&config);
    session
        .login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap();

    let api = ApiClient::new(&config, session.credentials().bearer()).unwrap();
    let controller = BookingController::new(api, session.clone() as Arc<dyn SessionExpiryHandler>);
    assert_eq!(controller.load_bookings().await.unwrap().len(), 2);

    let cancelled = controller.cancel(&BookingId::from("b1")).await.unwrap();
    assert_eq!(cancelled.status, BookingStatus::Cancelled);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 1);

    // Customer may not cancel a confirmed booking: refused locally.
    let err = controller.cancel(&BookingId::from("b2")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationRejected);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn server_validation_error_leaves_booking_untouched() {
    let (base, state) = spawn_backend().await;
    let config = config(&base);
    let session = reconciler(&config);
    session
        .login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap();

    let api = ApiClient::new(&config, session.credentials().bearer()).unwrap();
    let controller = BookingController::new(api, session.clone() as Arc<dyn SessionExpiryHandler>);
    controller.load_bookings().await.unwrap();
    // Pretend the local view still shows b2 as pending.
    let mut stale = controller.booking(&BookingId::from("b2")).unwrap();
    stale.status = BookingStatus::Pending;
    controller.upsert(stale);

    let err = controller.cancel(&BookingId::from("b2")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ValidationRejected);
    assert!(err.to_string().contains("no longer be cancelled"));
    assert_eq!(state.cancels.load(Ordering::SeqCst), 1);
    let b2 = controller.booking(&BookingId::from("b2")).unwrap();
    assert_eq!(b2.status, BookingStatus::Pending);
    assert_eq!(b2.payment_status, PaymentStatus::Unpaid);
}

fn checkout_request() -> CheckoutRequest {
    CheckoutRequest {
        package_id: PackageId::from("pkg-1".to_string()),
        travelers: 2,
        contact: Contact {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            phone: "+1 555 0100".into(),
        },
        start_date: None,
    }
}

fn card(number: &str) -> CardDetails {
    CardDetails {
        number: number.into(),
        exp_month: 12,
        exp_year: 2030,
        cvc: "123".into(),
        holder_name: Some("Ana".into()),
    }
}

#[tokio::test]
async fn checkout_through_backend_and_processor() {
    let (base, state) = spawn_backend().await;
    let config = config(&base);
    let session = reconciler(&config);
    session
        .login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap();

    let api = ApiClient::new(&config, session.credentials().bearer()).unwrap();
    let processor = HttpCardProcessor::new(&config).unwrap();
    let coordinator = PaymentCoordinator::new(
        api,
        processor,
        session.clone() as Arc<dyn SessionExpiryHandler>,
    );

    let receipt = coordinator
        .checkout(&checkout_request(), &card("4242424242424242"))
        .await
        .unwrap();
    assert_eq!(receipt.booking_id, BookingId::from("b9"));
    assert_eq!(receipt.provider_payment_id.to_string(), "pi_42");
    assert_eq!(
        receipt.payment_record_id.map(|p| p.to_string()).as_deref(),
        Some("pay-9")
    );
    assert_eq!(state.confirms.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn declined_card_is_not_confirmed_with_server() {
    let (base, state) = spawn_backend().await;
    let config = config(&base);
    let session = reconciler(&config);
    session
        .login(&LoginRequest::new("ana@example.com", "secret"))
        .await
        .unwrap();

    let api = ApiClient::new(&config, session.credentials().bearer()).unwrap();
    let processor = HttpCardProcessor::new(&config).unwrap();
    let coordinator = PaymentCoordinator::new(
        api,
        processor,
        session.clone() as Arc<dyn SessionExpiryHandler>,
    );

    let err = coordinator
        .checkout(&checkout_request(), &card("4000000000000002"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PaymentDeclined);
    assert_eq!(state.confirms.load(Ordering::SeqCst), 0);
}
