//! Sync the latest checkout of every profile in a Klaviyo segment onto the profile.

pub mod klaviyo;
pub mod settings;
pub mod sync;
pub mod utils;
