//! Preview sessions: one sandboxed checkout per session, driven by a state
//! machine.
//!
//! | Module        | Role                                                   |
//! |---------------|--------------------------------------------------------|
//! | `models`      | `Session`, `SessionConfig`, `EditEntry`, statuses       |
//! | `machine`     | lifecycle state machine (configure, provision, edit)   |
//! | `manager`     | registry of live machines, rehydration from the store  |
//! | `rpc`         | method registry and socket frames                      |
//! | `channel`     | progress stream between a call and its caller          |
//! | `notifier`    | per-session state broadcast                            |
//! | `db`          | SQLite persistence                                     |
//! | `environment` | sandbox abstraction                                    |
//! | `local`       | process-backed sandbox on the host filesystem          |
//! | `credentials` | GitHub App installation tokens                         |
//! | `merge`       | deep merge for tool configuration                      |
//! | `prompt`      | edit prompt construction                               |

pub mod channel;
pub mod credentials;
pub mod db;
pub mod environment;
pub mod local;
pub mod machine;
pub mod manager;
pub mod merge;
pub mod models;
pub mod notifier;
pub mod prompt;
pub mod rpc;

#[cfg(test)]
pub(crate) mod testing;
