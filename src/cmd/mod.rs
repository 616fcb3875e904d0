//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `init`   | `Init`           |
//! | `run`    | `Run`            |
//! | `purge`  | `Purge`          |
//! | `config` | `Config`         |

pub mod config;
pub mod init;
pub mod purge;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use init::cmd_init;
pub use purge::cmd_purge;
pub use run::cmd_run;
pub use serve::cmd_serve;
