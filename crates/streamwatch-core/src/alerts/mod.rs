//! Alert routing
//!
//! This module contains:
//! - The session alert log ([`log`])
//! - The audible alert tone ([`tone`])
//! - The email notification channel ([`email`])
//! - The router tying them to controller transitions ([`router`])

pub mod email;
pub mod log;
pub mod router;
pub mod tone;

pub use email::{EmailChannel, HttpNotificationTransport, NotificationTransport, NotifyError};
pub use router::{AlertSettingsError, AlertUpdate};
pub use tone::{AlertSound, AudioContextState, SilentSound, SystemTone};
