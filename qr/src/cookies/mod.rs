//! Run-wide cookie storage

pub mod jar;

pub use jar::{CookieJar, StoredCookie};
