//! Various useful things.

pub mod binio;
pub mod date;
pub mod flight;
pub mod sync;
