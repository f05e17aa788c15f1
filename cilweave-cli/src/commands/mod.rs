pub mod common;
pub mod disasm;
pub mod patch;
pub mod restore;
pub mod status;
pub mod support;
pub mod verify;
