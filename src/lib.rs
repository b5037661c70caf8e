pub mod brew;
pub mod check;
pub mod cli;
pub mod config;
pub mod launchd;
pub mod lock;
pub mod logging;
pub mod notify;
pub mod select;
pub mod state;
pub mod upgrade;
pub mod version;
