pub mod retry;

pub use retry::{retry_until_cancelled, sleep_or_cancelled};
