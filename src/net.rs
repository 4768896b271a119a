//! Shared HTTP client configuration for the REST-backed collaborators.
//!
//! Grounded on `net::client::HttpClient`: a thin wrapper fixing user-agent
//! and timeouts so every collaborator client looks the same.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

pub const USER_AGENT: &str = "semantic-memory/0.1.0";
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a `reqwest::Client` with the crate's standard timeouts/user-agent.
pub fn default_client() -> Client {
    builder().build().unwrap_or_default()
}

pub fn builder() -> ClientBuilder {
    Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(REQUEST_TIMEOUT)
}
