// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for CouchDB.
//!
//! Provides helpers to spin up a single-node CouchDB for integration tests.

use repdyno::config::HarnessConfig;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

pub const COUCH_USER: &str = "adm";
pub const COUCH_PASSWORD: &str = "pass";

/// Create a single-node CouchDB container with an admin user.
///
/// Uses the official couchdb:3 image. Waits for "Apache CouchDB has started".
pub fn couchdb_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("couchdb", "3")
        .with_env_var("COUCHDB_USER", COUCH_USER)
        .with_env_var("COUCHDB_PASSWORD", COUCH_PASSWORD)
        .with_exposed_port(5984)
        .with_wait_for(WaitFor::message_on_stderr("Apache CouchDB has started"));
    docker.run(image)
}

/// Get the admin URL for a container.
pub fn couchdb_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(5984);
    format!("http://{}:{}@127.0.0.1:{}", COUCH_USER, COUCH_PASSWORD, port)
}

/// Helper struct for a CouchDB server plus a harness config pointing at it.
pub struct TestCouch<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub url: String,
}

impl<'a> TestCouch<'a> {
    pub fn new(docker: &'a Cli) -> Self {
        let container = couchdb_container(docker);
        let url = couchdb_url(&container);
        Self { container, url }
    }

    /// Test config for `prefix` against this server, with a short cycle
    /// timeout so a stuck replication fails fast.
    pub fn config(&self, prefix: &str) -> HarnessConfig {
        let mut config = HarnessConfig::for_testing(prefix).with_server_url(&self.url);
        config.cycle_timeout = "120s".to_string();
        config.cycle_interval = "500ms".to_string();
        config
    }
}
