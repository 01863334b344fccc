#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub const PROTOCOL_ID: u16 = 0x0d6a;
pub const VERSION_ID: [u8; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];

pub mod logging;
pub mod shared;
pub mod time;
