//! HTTP and WebSocket front door for sessions.
//!
//! ```text
//! ┌──────────┐   HTTP   ┌───────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (Router, build_state, listener)   │
//! │          │ <─────── │    ├─ api.rs  (sites, sessions, ApiError)     │
//! └──────────┘ WebSocket│    └─ ws.rs   (per-session socket loop)       │
//!                       │         │ RpcRequest → MethodRegistry         │
//!                       │         v                                     │
//!                       │  session::SessionMachine                      │
//!                       └───────────────────────────────────────────────┘
//! ```
//!
//! Socket protocol: the client sends `{"id", "method", "params"}`; the server
//! answers with `chunk`, `done` and `error` frames carrying the same id, and
//! pushes a `state` frame after every mutation of the session.

pub mod api;
pub mod server;
pub mod ws;

#[cfg(test)]
pub(crate) fn test_state() -> api::SharedState {
    use std::sync::Arc;

    use crate::config::SiteConfig;
    use crate::session::db::SessionDb;
    use crate::session::manager::SessionManager;
    use crate::session::rpc::MethodRegistry;
    use crate::session::testing::{FakeCredentials, FakeEnvironmentFactory, test_settings};

    let manager = SessionManager::new(
        SessionDb::in_memory().unwrap(),
        Arc::new(FakeEnvironmentFactory),
        Arc::new(FakeCredentials::token("ghs_test")),
        test_settings(),
    );
    Arc::new(api::AppState {
        manager: Arc::new(manager),
        registry: Arc::new(MethodRegistry::standard().unwrap()),
        sites: vec![SiteConfig {
            key: "acme".into(),
            repo_owner: "acme".into(),
            repo_name: "site".into(),
            display_name: "Acme".into(),
            site_url: "https://acme.test".into(),
            preview_port: 4321,
            hostname: "example.test".into(),
        }],
    })
}
