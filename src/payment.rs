//! Checkout payment handshake.
//!
//! Three phases, each a distinct type:
//!
//! 1. [`PaymentCoordinator::create_intent`] → [`IntentCreated`]: the server
//!    creates a `pending/unpaid` booking and a processor intent.
//! 2. [`PaymentCoordinator::submit_card`] → [`ProcessorSettled`]: the card is
//!    charged by the external processor.
//! 3. [`PaymentCoordinator::confirm`] → [`PaymentReceipt`]: the server records
//!    the charge and marks the booking `paid/confirmed`.
//!
//! A `ProcessorSettled` can only be built from a `succeeded` processor
//! outcome, and an `IntentCreated` only from a server response, so the phases
//! cannot run out of order.
//!
//! Phase 2 cannot be cancelled once submitted: callers must drive
//! [`submit_card`](PaymentCoordinator::submit_card) to completion rather than
//! dropping it. To retry after a phase-2 failure, reuse the same
//! `IntentCreated` instead of creating a new intent.
//! [`checkout`](PaymentCoordinator::checkout) does this itself: the intent of
//! a declined attempt is kept and reused when the same request is retried.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Rejection};
use crate::session::SessionExpiryHandler;
use crate::types::{BookingId, PackageId, PaymentId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// Booking parameters sent with the intent request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub package_id: PackageId,
    pub travelers: u32,
    #[serde(flatten)]
    pub contact: Contact,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub start_date: Option<OffsetDateTime>,
}

/// Processor client secret. Never logged.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientSecret(String);

impl ClientSecret {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Processor intent id embedded in the secret (`pi_123_secret_abc` → `pi_123`).
    #[must_use]
    pub fn intent_id(&self) -> &str {
        self.0.split("_secret_").next().unwrap_or(&self.0)
    }
}

impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientSecret(***)")
    }
}

/// Server-issued intent, held only for the duration of one checkout.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub client_secret: ClientSecret,
    pub booking_id: BookingId,
    #[serde(default)]
    pub provider_payment_id: Option<PaymentId>,
}

/// Card data handed to the processor for tokenization. Never logged.
#[derive(Clone)]
pub struct CardDetails {
    pub number: String,
    pub exp_month: u8,
    pub exp_year: u16,
    pub cvc: String,
    pub holder_name: Option<String>,
}

impl std::fmt::Debug for CardDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let last4 = self
            .number
            .get(self.number.len().saturating_sub(4)..)
            .unwrap_or_default();
        f.debug_struct("CardDetails")
            .field("number", &format_args!("**** {last4}"))
            .field("exp_month", &self.exp_month)
            .field("exp_year", &self.exp_year)
            .finish_non_exhaustive()
    }
}

/// Processor token standing in for card data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentMethodId(pub String);

/// `confirmCardPayment` result: either `error` or `paymentIntent`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorResponse {
    #[serde(default)]
    pub error: Option<ProcessorError>,
    #[serde(default)]
    pub payment_intent: Option<ProcessorIntent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorIntent {
    pub id: PaymentId,
    pub status: String,
}

/// Body of `POST /payments/confirm`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentConfirmation {
    pub payment_intent_id: PaymentId,
    pub booking_id: BookingId,
}

/// Backend payment endpoints.
pub trait PaymentBackend: Send + Sync + 'static {
    /// `POST /payments/create-payment-intent`. Not idempotent: every call
    /// creates a booking.
    fn create_payment_intent(
        &self,
        request: &CheckoutRequest,
    ) -> impl Future<Output = Result<PaymentIntent, Error>> + Send;

    /// `POST /payments/confirm`. Returns the server's payment record id if it
    /// reports one.
    fn confirm_payment(
        &self,
        confirmation: &PaymentConfirmation,
    ) -> impl Future<Output = Result<Option<PaymentId>, Error>> + Send;
}

/// External card processor.
pub trait CardProcessor: Send + Sync + 'static {
    /// Tokenizes card data.
    fn create_payment_method(
        &self,
        card: &CardDetails,
    ) -> impl Future<Output = Result<PaymentMethodId, Error>> + Send;

    /// `confirmCardPayment(clientSecret, paymentMethod)`.
    fn confirm_card_payment(
        &self,
        client_secret: &ClientSecret,
        payment_method: &PaymentMethodId,
    ) -> impl Future<Output = Result<ProcessorResponse, Error>> + Send;
}

/// Phase 1 done: a server intent is in hand.
#[derive(Debug, Clone)]
pub struct IntentCreated {
    intent: PaymentIntent,
}

impl IntentCreated {
    #[must_use]
    pub fn intent(&self) -> &PaymentIntent {
        &self.intent
    }

    #[must_use]
    pub fn booking_id(&self) -> &BookingId {
        &self.intent.booking_id
    }
}

/// Phase 2 done: the processor reported `succeeded`.
#[derive(Debug, Clone)]
pub struct ProcessorSettled {
    booking_id: BookingId,
    provider_payment_id: PaymentId,
}

impl ProcessorSettled {
    #[must_use]
    pub fn booking_id(&self) -> &BookingId {
        &self.booking_id
    }

    #[must_use]
    pub fn provider_payment_id(&self) -> &PaymentId {
        &self.provider_payment_id
    }
}

/// Phase 3 done: the server recorded the payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentReceipt {
    pub booking_id: BookingId,
    pub provider_payment_id: PaymentId,
    pub payment_record_id: Option<PaymentId>,
}

/// Clears the submission flag when dropped.
struct Submission<'a>(&'a AtomicBool);

impl<'a> Submission<'a> {
    fn begin(flag: &'a AtomicBool) -> Result<Self, Rejection> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| Self(flag))
            .map_err(|_| Rejection::SubmissionInFlight)
    }
}

impl Drop for Submission<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PaymentCoordinator<P, C> {
    backend: P,
    processor: C,
    expiry: Arc<dyn SessionExpiryHandler>,
    submitting: AtomicBool,
    // Intent whose card step failed, with the request that created it.
    retry: Mutex<Option<(CheckoutRequest, IntentCreated)>>,
}

impl<P: PaymentBackend, C: CardProcessor> PaymentCoordinator<P, C> {
    #[must_use]
    pub fn new(backend: P, processor: C, expiry: Arc<dyn SessionExpiryHandler>) -> Self {
        Self {
            backend,
            processor,
            expiry,
            submitting: AtomicBool::new(false),
            retry: Mutex::new(None),
        }
    }

    /// Whether a checkout submission is currently in flight.
    #[must_use]
    pub fn is_submitting(&self) -> bool {
        self.submitting.load(Ordering::SeqCst)
    }

    /// Runs all three phases.
    ///
    /// If the card step of an earlier call with an equal `request` failed,
    /// its intent is reused and no new booking is created.
    ///
    /// # Errors
    ///
    /// [`Error::Rejected`] if another submission is in flight; phase 1 and
    /// phase 2 errors as returned by [`create_intent`](Self::create_intent)
    /// and [`submit_card`](Self::submit_card); [`Error::PaymentRecordingFailed`]
    /// if the card was charged but phase 3 failed.
    pub async fn checkout(
        &self,
        request: &CheckoutRequest,
        card: &CardDetails,
    ) -> Result<PaymentReceipt, Error> {
        let _submission = Submission::begin(&self.submitting)?;
        let created = match self.take_retry(request) {
            Some(created) => {
                tracing::info!(booking_id = %created.booking_id(), "Reusing payment intent");
                created
            }
            None => self.request_intent(request).await?,
        };
        self.settle(request, created, card).await
    }

    /// Phases 2 and 3 for an intent obtained from
    /// [`create_intent`](Self::create_intent).
    ///
    /// # Errors
    ///
    /// Same as [`checkout`](Self::checkout), without the phase 1 errors.
    pub async fn resume_checkout(
        &self,
        created: &IntentCreated,
        card: &CardDetails,
    ) -> Result<PaymentReceipt, Error> {
        let _submission = Submission::begin(&self.submitting)?;
        let settled = self.submit_card(created, card).await?;
        self.confirm(settled).await
    }

    /// Booking id of the intent kept from a failed card step, if any.
    #[must_use]
    pub fn retained_intent(&self) -> Option<BookingId> {
        self.retry
            .lock()
            .as_ref()
            .map(|(_, created)| created.booking_id().clone())
    }

    async fn settle(
        &self,
        request: &CheckoutRequest,
        created: IntentCreated,
        card: &CardDetails,
    ) -> Result<PaymentReceipt, Error> {
        match self.submit_card(&created, card).await {
            Ok(settled) => self.confirm(settled).await,
            Err(e) => {
                *self.retry.lock() = Some((request.clone(), created));
                Err(e)
            }
        }
    }

    fn take_retry(&self, request: &CheckoutRequest) -> Option<IntentCreated> {
        let (kept_for, created) = self.retry.lock().take()?;
        if &kept_for == request {
            Some(created)
        } else {
            tracing::debug!(booking_id = %created.booking_id(), "Dropping intent kept for a different request");
            None
        }
    }

    /// Phase 1. Suppresses a duplicate call while one is in flight.
    ///
    /// # Errors
    ///
    /// [`Error::Rejected`] for a duplicate submit, otherwise the backend's error.
    pub async fn create_intent(&self, request: &CheckoutRequest) -> Result<IntentCreated, Error> {
        let _submission = Submission::begin(&self.submitting)?;
        self.request_intent(request).await
    }

    async fn request_intent(&self, request: &CheckoutRequest) -> Result<IntentCreated, Error> {
        let result = self.backend.create_payment_intent(request).await;
        let intent = self.observe(result).map_err(|e| {
            tracing::warn!(package_id = %request.package_id, error = %e, "Payment intent creation failed");
            e
        })?;
        tracing::info!(booking_id = %intent.booking_id, "Payment intent created");
        Ok(IntentCreated { intent })
    }

    /// Phase 2: tokenizes the card and confirms the intent with the processor.
    ///
    /// # Errors
    ///
    /// [`Error::PaymentDeclined`] or [`Error::PaymentRequiresAction`] for
    /// processor outcomes other than `succeeded`, or a transport error.
    pub async fn submit_card(
        &self,
        created: &IntentCreated,
        card: &CardDetails,
    ) -> Result<ProcessorSettled, Error> {
        let booking_id = created.booking_id().clone();
        let method = self.processor.create_payment_method(card).await?;
        let response = self
            .processor
            .confirm_card_payment(&created.intent.client_secret, &method)
            .await?;

        if let Some(err) = response.error {
            tracing::info!(booking_id = %booking_id, code = ?err.code, "Card payment declined");
            return Err(Error::PaymentDeclined(err.message));
        }
        let intent = response
            .payment_intent
            .ok_or_else(|| Error::Unknown("processor returned neither error nor intent".into()))?;

        match intent.status.as_str() {
            "succeeded" => {
                tracing::info!(booking_id = %booking_id, provider_payment_id = %intent.id, "Card payment succeeded");
                Ok(ProcessorSettled {
                    booking_id,
                    provider_payment_id: intent.id,
                })
            }
            "requires_action" => Err(Error::PaymentRequiresAction),
            other => Err(Error::PaymentDeclined(format!("payment {other}"))),
        }
    }

    /// Phase 3: records the settled charge with the server.
    ///
    /// # Errors
    ///
    /// Always [`Error::PaymentRecordingFailed`] on failure, since the card has
    /// already been charged.
    pub async fn confirm(&self, settled: ProcessorSettled) -> Result<PaymentReceipt, Error> {
        let confirmation = PaymentConfirmation {
            payment_intent_id: settled.provider_payment_id.clone(),
            booking_id: settled.booking_id.clone(),
        };
        match self.observe(self.backend.confirm_payment(&confirmation).await) {
            Ok(payment_record_id) => {
                tracing::info!(booking_id = %settled.booking_id, "Payment recorded");
                Ok(PaymentReceipt {
                    booking_id: settled.booking_id,
                    provider_payment_id: settled.provider_payment_id,
                    payment_record_id,
                })
            }
            Err(e) => {
                tracing::error!(
                    booking_id = %settled.booking_id,
                    provider_payment_id = %settled.provider_payment_id,
                    error = %e,
                    "Payment captured but not recorded"
                );
                Err(Error::PaymentRecordingFailed {
                    booking_id: settled.booking_id,
                    provider_payment_id: settled.provider_payment_id,
                    reason: Box::new(e),
                })
            }
        }
    }

    fn observe<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        if let Err(e) = &result {
            if e.is_session_expired() {
                self.expiry.session_expired();
            }
        }
        result
    }
}
