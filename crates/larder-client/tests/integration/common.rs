//! Shared fixtures for client integration tests.

use std::time::Duration;

use larder_client::MyFoodRepoClient;
use larder_core::{HttpConfig, PartnerCredentials};
use serde_json::{Value, json};
use wiremock::MockServer;

pub const UID: &str = "researcher@example.org";
pub const CLIENT: &str = "client-id";
pub const TOKEN: &str = "secret-token";

pub fn credentials() -> PartnerCredentials {
    PartnerCredentials {
        uid: UID.to_string(),
        client: CLIENT.to_string(),
        access_token: TOKEN.to_string(),
    }
}

/// A client pointed at the mock server with a short timeout.
pub fn client_for(server: &MockServer) -> MyFoodRepoClient {
    let config = HttpConfig::default().with_timeout(Duration::from_secs(1));
    MyFoodRepoClient::new(&server.uri(), &credentials(), &config)
        .expect("mock server uri is a valid base url")
}

pub fn participations_body(rows: &[(&str, &str)], next: Option<u32>) -> Value {
    let data: Vec<Value> = rows
        .iter()
        .map(|(id, key)| json!({"id": id, "type": "participation", "attributes": {"key": key}}))
        .collect();
    json!({"data": data, "meta": {"next": next}})
}
