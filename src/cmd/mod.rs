//! CLI command handlers extracted from main.rs.
//!
//! Each submodule groups the handlers for a single command.
//!
//! | Module   | Command(s)                               |
//! |----------|------------------------------------------|
//! | `serve`  | `sitecraft serve`                        |
//! | `config` | `sitecraft config show\|validate\|init`  |
//! | `token`  | `sitecraft mint-token`                   |

mod config;
mod serve;
mod token;

pub use config::cmd_config;
pub use serve::cmd_serve;
pub use token::cmd_mint_token;
