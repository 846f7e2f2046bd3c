//! Small value types shared across the crate.

mod hash_rate;
mod wakeup;

pub use hash_rate::HashRate;
pub use wakeup::Wakeup;
