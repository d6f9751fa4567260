pub mod args;
pub mod commands;

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network/connection error (e.g., no nsqd reachable)
    pub const NETWORK_ERROR: u8 = 1;
    /// Bad arguments (unparsable address, invalid topic name)
    pub const USAGE_ERROR: u8 = 2;
}
