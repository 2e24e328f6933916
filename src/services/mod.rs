pub mod access;
pub mod auth;
pub mod encryption;
pub mod file;
pub mod reconcile;
pub mod record;
pub mod reward;
pub mod settlement;
pub mod user;
pub mod validation;

pub use access::AccessService;
pub use auth::{ActionMessage, AuthService};
pub use encryption::EncryptionService;
pub use file::FileService;
pub use reconcile::ReconciliationService;
pub use record::RecordService;
pub use reward::RewardService;
pub use settlement::{LedgerHandle, RetryPolicy, SettlementQueue, SettlementSnapshot};
pub use user::UserService;
