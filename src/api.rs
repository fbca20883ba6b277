use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::booking::{Booking, BookingBackend, BookingStatus, PaymentStatus};
use crate::config::ClientConfig;
use crate::credentials::BearerToken;
use crate::error::Error;
use crate::payment::{CheckoutRequest, PaymentBackend, PaymentConfirmation, PaymentIntent};
use crate::session::{
    AuthBackend, LoginRequest, LoginResponse, PasswordChange, PhotoUpdate, ProfileUpdate,
};
use crate::types::{BookingId, PaymentId, UserSnapshot};

/// HTTP client for the booking backend.
///
/// Attaches `Authorization: Bearer <token>` from the shared [`BearerToken`]
/// on every request while one is set.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Url,
    http: reqwest::Client,
    bearer: BearerToken,
}

/// Body shapes the backend uses for single objects: wrapped or bare.
#[derive(Deserialize)]
#[serde(untagged)]
enum UserBody {
    Wrapped { user: UserSnapshot },
    Bare(UserSnapshot),
}

impl From<UserBody> for UserSnapshot {
    fn from(body: UserBody) -> Self {
        match body {
            UserBody::Wrapped { user } | UserBody::Bare(user) => user,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BookingBody {
    Wrapped { booking: Booking },
    Bare(Booking),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BookingListBody {
    Wrapped { bookings: Vec<Booking> },
    Bare(Vec<Booking>),
}

#[derive(Deserialize)]
struct RecordRef {
    #[serde(alias = "_id")]
    id: PaymentId,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmBody {
    #[serde(default)]
    payment: Option<RecordRef>,
    #[serde(default)]
    payment_id: Option<PaymentId>,
}

#[derive(Default, Deserialize)]
struct ServerMessage {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Serialize)]
struct StatusUpdate<S> {
    status: S,
}

impl ApiClient {
    /// Builds a client from `config`, sharing `bearer` with the credential store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig, bearer: BearerToken) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .user_agent(config.user_agent())
            .build()
            .map_err(|e| Error::Config(format!("http client: {e}")))?;
        Ok(Self {
            base_url: config.api_base_url().clone(),
            http,
            bearer,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    fn url(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Config(format!("endpoint {path}: {e}")))
    }

    async fn request<B, T>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        operation: &'static str,
    ) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.execute(method, path, body, operation).await?;
        response.json::<T>().await.map_err(|e| {
            tracing::warn!(operation, error = %e, "Undecodable response body");
            Error::Unknown(format!("{operation}: {e}"))
        })
    }

    async fn execute<B>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error>
    where
        B: Serialize + ?Sized,
    {
        let mut builder = self.http.request(method, self.url(path)?);
        let token = self.bearer.get();
        if let Some(token) = &token {
            builder = builder.bearer_auth(token.as_str());
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(operation, error = %e, "Request failed");
            Error::from(e)
        })?;
        Self::ensure_success(response, operation, token.is_some()).await
    }

    /// Checks HTTP response status; returns the response on success or the
    /// matching error kind.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
        authenticated: bool,
    ) -> Result<reqwest::Response, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ServerMessage>(&body)
            .ok()
            .and_then(|m| m.message.or(m.error))
            .unwrap_or(body);
        tracing::debug!(operation, status = status.as_u16(), %message, "Request rejected");
        Err(error_for_status(status, authenticated, message))
    }
}

fn error_for_status(status: StatusCode, authenticated: bool, message: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED if authenticated => Error::SessionExpired,
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(message),
        StatusCode::NOT_FOUND => Error::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            Error::ValidationRejected(message)
        }
        _ => Error::Unknown(format!("HTTP {}: {message}", status.as_u16())),
    }
}

impl AuthBackend for ApiClient {
    async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, Error> {
        self.request(reqwest::Method::POST, "auth/login", Some(request), "login")
            .await
    }

    async fn admin_login(&self, request: &LoginRequest) -> Result<LoginResponse, Error> {
        self.request(
            reqwest::Method::POST,
            "auth/admin/login",
            Some(request),
            "admin login",
        )
        .await
    }

    async fn me(&self) -> Result<UserSnapshot, Error> {
        self.request::<(), UserBody>(reqwest::Method::GET, "auth/me", None, "who am I")
            .await
            .map(Into::into)
    }

    async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserSnapshot, Error> {
        self.request::<_, UserBody>(
            reqwest::Method::PUT,
            "auth/updateprofile",
            Some(update),
            "profile update",
        )
        .await
        .map(Into::into)
    }

    async fn update_photo(&self, update: &PhotoUpdate) -> Result<UserSnapshot, Error> {
        self.request::<_, UserBody>(
            reqwest::Method::PUT,
            "auth/updatephoto",
            Some(update),
            "photo update",
        )
        .await
        .map(Into::into)
    }

    async fn change_password(&self, change: &PasswordChange) -> Result<(), Error> {
        self.execute(
            reqwest::Method::POST,
            "auth/changepassword",
            Some(change),
            "password change",
        )
        .await
        .map(|_| ())
    }
}

impl BookingBackend for ApiClient {
    async fn list_bookings(&self) -> Result<Vec<Booking>, Error> {
        let body: BookingListBody = self
            .request::<(), _>(reqwest::Method::GET, "auth/bookings", None, "booking list")
            .await?;
        Ok(match body {
            BookingListBody::Wrapped { bookings } | BookingListBody::Bare(bookings) => bookings,
        })
    }

    async fn get_booking(&self, id: &BookingId) -> Result<Booking, Error> {
        let body: BookingBody = self
            .request::<(), _>(
                reqwest::Method::GET,
                &format!("auth/bookings/{}", urlencoding::encode(&id.0)),
                None,
                "booking detail",
            )
            .await?;
        Ok(match body {
            BookingBody::Wrapped { booking } | BookingBody::Bare(booking) => booking,
        })
    }

    async fn cancel_booking(&self, id: &BookingId) -> Result<(), Error> {
        self.execute::<()>(
            reqwest::Method::PUT,
            &format!("bookings/{}/cancel", urlencoding::encode(&id.0)),
            None,
            "booking cancel",
        )
        .await
        .map(|_| ())
    }

    async fn update_booking_status(&self, id: &BookingId, status: BookingStatus) -> Result<(), Error> {
        self.execute(
            reqwest::Method::PUT,
            &format!("bookings/{}", urlencoding::encode(&id.0)),
            Some(&StatusUpdate { status }),
            "booking status update",
        )
        .await
        .map(|_| ())
    }

    async fn update_payment_status(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> Result<(), Error> {
        self.execute(
            reqwest::Method::PUT,
            &format!("payments/{}", urlencoding::encode(&payment_id.0)),
            Some(&StatusUpdate { status }),
            "payment status update",
        )
        .await
        .map(|_| ())
    }
}

impl PaymentBackend for ApiClient {
    async fn create_payment_intent(&self, request: &CheckoutRequest) -> Result<PaymentIntent, Error> {
        self.request(
            reqwest::Method::POST,
            "payments/create-payment-intent",
            Some(request),
            "payment intent",
        )
        .await
    }

    async fn confirm_payment(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> Result<Option<PaymentId>, Error> {
        let response = self
            .execute(
                reqwest::Method::POST,
                "payments/confirm",
                Some(confirmation),
                "payment confirmation",
            )
            .await?;
        // The record id is informational; an empty or unexpected body still
        // means the server accepted the confirmation.
        let body: ConfirmBody = response.json().await.unwrap_or_default();
        Ok(body.payment.map(|p| p.id).or(body.payment_id))
    }
}
