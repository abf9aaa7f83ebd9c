pub mod constants;
pub mod key;
pub mod socket;
pub(crate) mod user_data;
