//! The cooperative lock between scale views and the `RisingWave` they scale.

pub mod helper;
pub mod lock;
pub mod split;
