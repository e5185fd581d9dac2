//! Engine event distribution and alert delivery.

pub mod alert;
pub mod bus;
