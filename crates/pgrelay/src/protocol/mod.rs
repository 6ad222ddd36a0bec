//! Wire protocol support

pub mod postgres;
