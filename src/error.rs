use crate::booking::{BookingStatus, PaymentStatus};
use crate::types::{BookingId, PaymentId};

/// Coarse failure category shared by every component.
///
/// Callers branch on this, not on [`Error`] variants, when choosing what to
/// show the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    NetworkUnreachable,
    /// Bad credentials, or a token whose role does not match the login flow.
    Unauthorized,
    /// The server rejected a previously valid token.
    SessionExpired,
    ValidationRejected,
    PaymentDeclined,
    /// The processor captured the payment but the server never recorded it.
    PaymentRecordingFailed,
    NotFound,
    Unknown,
}

/// Why a request was refused before any network call was made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Rejection {
    #[error("booking status cannot move from {from} to {to}")]
    StatusTransition { from: BookingStatus, to: BookingStatus },

    #[error("payment status cannot move from {from} to {to} while booking is {status}")]
    PaymentTransition {
        status: BookingStatus,
        from: PaymentStatus,
        to: PaymentStatus,
    },

    #[error("another update for booking {0} is still in flight")]
    InFlight(BookingId),

    #[error("booking {0} has no payment record")]
    NoPaymentRecord(BookingId),

    #[error("booking {0} is not loaded")]
    UnknownBooking(BookingId),

    #[error("a checkout submission is already in flight")]
    SubmissionInFlight,
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("session expired")]
    SessionExpired,

    #[error("rejected by server: {0}")]
    ValidationRejected(String),

    #[error("request refused: {0}")]
    Rejected(#[from] Rejection),

    #[error("payment declined: {0}")]
    PaymentDeclined(String),

    #[error("payment requires additional authentication, please try again")]
    PaymentRequiresAction,

    #[error(
        "payment {provider_payment_id} for booking {booking_id} was received but could not be \
         recorded ({reason}); contact support"
    )]
    PaymentRecordingFailed {
        booking_id: BookingId,
        provider_payment_id: PaymentId,
        reason: Box<Error>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unexpected error: {0}")]
    Unknown(String),
}

impl Error {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NetworkUnreachable(_) => ErrorKind::NetworkUnreachable,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::SessionExpired => ErrorKind::SessionExpired,
            Self::ValidationRejected(_) | Self::Rejected(_) => ErrorKind::ValidationRejected,
            Self::PaymentDeclined(_) | Self::PaymentRequiresAction => ErrorKind::PaymentDeclined,
            Self::PaymentRecordingFailed { .. } => ErrorKind::PaymentRecordingFailed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Storage(_) | Self::Config(_) | Self::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// True when the server signalled that the current token is no longer valid.
    #[must_use]
    pub fn is_session_expired(&self) -> bool {
        matches!(self, Self::SessionExpired)
    }
}

#[cfg(feature = "http")]
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Self::NetworkUnreachable(e.to_string())
        } else {
            Self::Unknown(e.to_string())
        }
    }
}
