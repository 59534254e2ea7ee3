mod admission;
mod clock;
pub mod db;
mod idempotency;
mod quota;
pub mod rate_limiting;
mod reaper;
mod services;
pub mod store;
mod supervisor;
mod work;

pub use admission::*;
pub use clock::*;
pub use idempotency::*;
pub use quota::*;
pub use reaper::*;
pub use services::*;
pub use supervisor::*;
pub use work::*;
