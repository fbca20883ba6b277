//! Booking lifecycle: coupled `status` / `paymentStatus` state machines.
//!
//! The controller's booking list is a local projection that may lag the
//! server. Successful transitions are merged into it optimistically; any
//! authoritative read ([`BookingController::load_bookings`],
//! [`BookingController::load_booking`]) replaces the affected records.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use derive_more::Display;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{Error, Rejection};
use crate::payment::PaymentReceipt;
use crate::session::SessionExpiryHandler;
use crate::types::{BookingId, PackageId, PaymentId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    #[display("pending")]
    Pending,
    #[display("confirmed")]
    Confirmed,
    #[display("completed")]
    Completed,
    #[display("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    #[display("unpaid")]
    Unpaid,
    #[display("partial")]
    Partial,
    #[display("paid")]
    Paid,
    #[display("refunded")]
    Refunded,
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Customer,
    Admin,
}

impl BookingStatus {
    /// Status values `actor` may move a booking to from `self`.
    #[must_use]
    pub fn next(self, actor: Actor) -> &'static [BookingStatus] {
        use BookingStatus::{Cancelled, Completed, Confirmed, Pending};
        match (self, actor) {
            (Pending, Actor::Customer) => &[Cancelled],
            (Pending, Actor::Admin) => &[Confirmed, Cancelled],
            (Confirmed, Actor::Admin) => &[Completed, Cancelled],
            _ => &[],
        }
    }
}

impl PaymentStatus {
    /// Payment status values an admin may set from `self` while the booking
    /// is in `status`. A refund requires a cancelled booking; a completed
    /// booking accepts no changes.
    #[must_use]
    pub fn next(self, status: BookingStatus) -> &'static [PaymentStatus] {
        use PaymentStatus::{Paid, Partial, Refunded, Unpaid};
        match (status, self) {
            (BookingStatus::Completed, _) => &[],
            (BookingStatus::Cancelled, Paid) => &[Refunded],
            (BookingStatus::Cancelled, _) => &[],
            (_, Unpaid) => &[Partial, Paid],
            (_, Partial) => &[Paid],
            (_, Paid | Refunded) => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TravelWindow {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_date: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Booking {
    #[serde(alias = "_id")]
    pub id: BookingId,
    #[serde(alias = "user")]
    pub user_id: UserId,
    #[serde(alias = "package")]
    pub package_ref: PackageId,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub booking_date: OffsetDateTime,
    #[serde(flatten)]
    pub travel_window: TravelWindow,
    /// Server payment record, once one exists.
    #[serde(default, alias = "payment", skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<PaymentId>,
}

/// Status transitions `actor` may request for `booking`.
#[must_use]
pub fn allowed_status_transitions(actor: Actor, booking: &Booking) -> &'static [BookingStatus] {
    booking.status.next(actor)
}

/// Payment status transitions an admin may request for `booking`.
#[must_use]
pub fn allowed_payment_transitions(booking: &Booking) -> &'static [PaymentStatus] {
    booking.payment_status.next(booking.status)
}

/// Backend booking and payment-record endpoints.
pub trait BookingBackend: Send + Sync + 'static {
    /// `GET /auth/bookings`
    fn list_bookings(&self) -> impl Future<Output = Result<Vec<Booking>, Error>> + Send;

    /// `GET /auth/bookings/:id`
    fn get_booking(&self, id: &BookingId) -> impl Future<Output = Result<Booking, Error>> + Send;

    /// `PUT /bookings/:id/cancel`
    fn cancel_booking(&self, id: &BookingId) -> impl Future<Output = Result<(), Error>> + Send;

    /// `PUT /bookings/:id`
    fn update_booking_status(
        &self,
        id: &BookingId,
        status: BookingStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    /// `PUT /payments/:id`
    fn update_payment_status(
        &self,
        payment_id: &PaymentId,
        status: PaymentStatus,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

#[derive(Debug, Clone, Copy)]
enum Change {
    Status(Actor, BookingStatus),
    Payment(PaymentStatus),
}

/// Marks a booking busy until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<BookingId>>,
    id: BookingId,
}

impl<'a> InFlight<'a> {
    fn acquire(set: &'a Mutex<HashSet<BookingId>>, id: &BookingId) -> Result<Self, Rejection> {
        if !set.lock().insert(id.clone()) {
            return Err(Rejection::InFlight(id.clone()));
        }
        Ok(Self { set, id: id.clone() })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

/// Validates and performs booking transitions for one signed-in client.
///
/// At most one transition per booking is in flight; a second request for
/// the same booking is rejected, not queued.
pub struct BookingController<B> {
    backend: B,
    expiry: Arc<dyn SessionExpiryHandler>,
    bookings: RwLock<Vec<Booking>>,
    in_flight: Mutex<HashSet<BookingId>>,
}

impl<B: BookingBackend> BookingController<B> {
    #[must_use]
    pub fn new(backend: B, expiry: Arc<dyn SessionExpiryHandler>) -> Self {
        Self {
            backend,
            expiry,
            bookings: RwLock::new(Vec::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Locally held bookings, in server order.
    #[must_use]
    pub fn bookings(&self) -> Vec<Booking> {
        self.bookings.read().clone()
    }

    #[must_use]
    pub fn booking(&self, id: &BookingId) -> Option<Booking> {
        self.bookings.read().iter().find(|b| &b.id == id).cloned()
    }

    /// Inserts or replaces a record obtained from an authoritative read
    /// made elsewhere (e.g. the admin booking table).
    pub fn upsert(&self, booking: Booking) {
        let mut bookings = self.bookings.write();
        match bookings.iter_mut().find(|b| b.id == booking.id) {
            Some(existing) => *existing = booking,
            None => bookings.push(booking),
        }
    }

    /// Replaces the local list with the server's.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the local list is left unchanged.
    pub async fn load_bookings(&self) -> Result<Vec<Booking>, Error> {
        let bookings = self.observe(self.backend.list_bookings().await)?;
        tracing::debug!(count = bookings.len(), "Loaded bookings");
        *self.bookings.write() = bookings.clone();
        Ok(bookings)
    }

    /// Fetches one booking and replaces its local record.
    ///
    /// # Errors
    ///
    /// Returns the backend's error; the local record is left unchanged.
    pub async fn load_booking(&self, id: &BookingId) -> Result<Booking, Error> {
        let booking = self.observe(self.backend.get_booking(id).await)?;
        self.upsert(booking.clone());
        Ok(booking)
    }

    /// Customer cancellation of a pending booking.
    ///
    /// # Errors
    ///
    /// [`Error::Rejected`] without a network call if the booking is unknown,
    /// busy, or not cancellable; otherwise the backend's error.
    pub async fn cancel(&self, id: &BookingId) -> Result<Booking, Error> {
        self.transition(id, Change::Status(Actor::Customer, BookingStatus::Cancelled))
            .await
    }

    /// Admin status change (confirm, complete, cancel).
    ///
    /// # Errors
    ///
    /// Same as [`cancel`](Self::cancel).
    pub async fn set_status(&self, id: &BookingId, status: BookingStatus) -> Result<Booking, Error> {
        self.transition(id, Change::Status(Actor::Admin, status)).await
    }

    /// Admin payment-status change, including refunds of cancelled bookings.
    ///
    /// # Errors
    ///
    /// Same as [`cancel`](Self::cancel), plus a rejection when the booking
    /// has no payment record to update.
    pub async fn set_payment_status(
        &self,
        id: &BookingId,
        status: PaymentStatus,
    ) -> Result<Booking, Error> {
        self.transition(id, Change::Payment(status)).await
    }

    /// Merges a completed payment handshake into the local record.
    ///
    /// Returns `false` if the booking is not held locally.
    pub fn record_payment(&self, receipt: &PaymentReceipt) -> bool {
        let mut bookings = self.bookings.write();
        let Some(booking) = bookings.iter_mut().find(|b| b.id == receipt.booking_id) else {
            return false;
        };
        booking.payment_status = PaymentStatus::Paid;
        if booking.status == BookingStatus::Pending {
            booking.status = BookingStatus::Confirmed;
        }
        if booking.payment_id.is_none() {
            booking.payment_id = receipt.payment_record_id.clone();
        }
        true
    }

    async fn transition(&self, id: &BookingId, change: Change) -> Result<Booking, Error> {
        let _busy = InFlight::acquire(&self.in_flight, id)?;
        let current = self
            .booking(id)
            .ok_or_else(|| Rejection::UnknownBooking(id.clone()))?;
        let call = validate(&current, change)?;

        tracing::debug!(booking_id = %id, ?change, "Requesting booking transition");
        let result = match call {
            Call::Cancel => self.backend.cancel_booking(id).await,
            Call::Status(status) => self.backend.update_booking_status(id, status).await,
            Call::Payment(payment_id, status) => {
                self.backend.update_payment_status(&payment_id, status).await
            }
        };

        if let Err(e) = self.observe(result) {
            tracing::warn!(booking_id = %id, error = %e, "Booking transition failed");
            return Err(e);
        }

        let mut bookings = self.bookings.write();
        let booking = bookings
            .iter_mut()
            .find(|b| &b.id == id)
            .ok_or_else(|| Rejection::UnknownBooking(id.clone()))?;
        match change {
            Change::Status(_, status) => booking.status = status,
            Change::Payment(status) => booking.payment_status = status,
        }
        tracing::info!(booking_id = %id, status = %booking.status, payment_status = %booking.payment_status, "Booking updated");
        Ok(booking.clone())
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

/// Backend request for a validated change.
enum Call {
    Cancel,
    Status(BookingStatus),
    Payment(PaymentId, PaymentStatus),
}

fn validate(booking: &Booking, change: Change) -> Result<Call, Rejection> {
    match change {
        Change::Status(actor, to) => {
            if !booking.status.next(actor).contains(&to) {
                Err(Rejection::StatusTransition {
                    from: booking.status,
                    to,
                })
            } else if actor == Actor::Customer {
                Ok(Call::Cancel)
            } else {
                Ok(Call::Status(to))
            }
        }
        Change::Payment(to) => {
            if !booking.payment_status.next(booking.status).contains(&to) {
                return Err(Rejection::PaymentTransition {
                    status: booking.status,
                    from: booking.payment_status,
                    to,
                });
            }
            booking
                .payment_id
                .clone()
                .map(|payment_id| Call::Payment(payment_id, to))
                .ok_or_else(|| Rejection::NoPaymentRecord(booking.id.clone()))
        }
    }
}
