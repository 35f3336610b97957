#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
extern crate std;

mod microseconds;
pub use microseconds::Microseconds;

mod timespan;
pub use timespan::TimeSpan;

pub const USEC_PER_SEC: i64 = 1_000_000;
