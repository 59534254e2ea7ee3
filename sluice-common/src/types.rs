mod secret;

pub use secret::Secret;
use uuid::Uuid;

pub type LeaseId = Uuid;
pub type WorkId = Uuid;
