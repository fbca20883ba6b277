#![doc = include_str!("../README.md")]

#[cfg(feature = "http")]
pub mod api;
pub mod booking;
pub mod config;
pub mod credentials;
pub mod error;
pub mod guard;
pub mod payment;
#[cfg(feature = "http")]
pub mod processor;
pub mod session;
pub mod types;

// Re-exports for convenient access
#[cfg(feature = "http")]
pub use api::ApiClient;
pub use booking::{
    allowed_payment_transitions, allowed_status_transitions, Actor, Booking, BookingBackend,
    BookingController, BookingStatus, PaymentStatus, TravelWindow,
};
pub use config::ClientConfig;
pub use credentials::{
    BearerToken, CredentialStore, FileStorage, MemoryStorage, StorageBackend, StoredCredentials,
};
pub use error::{Error, ErrorKind, Rejection};
pub use guard::{Decision, PathPattern, Requirement, RoleTable, RoleTableSpec};
pub use payment::{
    CardDetails, CardProcessor, CheckoutRequest, ClientSecret, Contact, IntentCreated,
    PaymentBackend, PaymentCoordinator, PaymentIntent, PaymentReceipt, ProcessorSettled,
};
#[cfg(feature = "http")]
pub use processor::HttpCardProcessor;
pub use session::{
    AuthBackend, LoginRequest, LoginResponse, Session, SessionExpiryHandler, SessionReconciler,
    SessionStatus,
};
pub use types::{BookingId, PackageId, PaymentId, Role, Token, UserId, UserSnapshot};
