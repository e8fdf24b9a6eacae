//! Process exit codes. Part of the CLI contract for scripts driving `tandem`.

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1; // Peer vanished, timed out, or operations left unfinished
pub const CONFIG_ERROR: i32 = 2; // Bad --config file or TANDEM_* variable
