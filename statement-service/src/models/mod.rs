pub mod account;
pub mod delivery;
pub mod destination;
pub mod statement;
pub mod upload;
pub mod webhook;

pub use account::{Account, AccountStatus, LearnedSchedule, SchedulePattern};
pub use delivery::{DeliveryAttempt, DeliveryStatus};
pub use destination::{Destination, DestinationStatus, ProviderKind};
pub use statement::{StatementRecord, UpstreamStatement};
pub use upload::{UploadSession, UploadStatus};
pub use webhook::WebhookEndpoint;
