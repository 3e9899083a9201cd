//! Keeps a sing-box configuration in sync with a subscription URL and
//! restarts the proxy when the configuration it runs with changes.

pub mod backend;
pub mod constants;
pub mod errors;
