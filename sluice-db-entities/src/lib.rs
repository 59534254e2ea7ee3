#![allow(non_snake_case)]

pub mod Lease;
pub mod ProcessedEvent;
pub mod QuotaSubject;
pub mod RateLimitBucket;
pub mod RateLimitMarker;
pub mod ResourceSlot;
pub mod UsageRecord;
pub mod WorkRecord;
