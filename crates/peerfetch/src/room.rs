//! Room discovery against the rendezvous service REST API
//!
//! The service groups peers behind the same public IP into a room. Joining
//! it lists the other members, which is how local clients find the device.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use peerfetch_config::Config;

use crate::transport::{DiscoveryError, RoomDiscovery};

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    #[serde(rename = "roomId")]
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct JoinRoomResponse {
    #[serde(rename = "clientsIds", default)]
    clients_ids: Vec<String>,
}

pub struct HttpRoomDiscovery {
    http: reqwest::Client,
    /// `{http base}{key}/`
    api_base: String,
}

impl HttpRoomDiscovery {
    pub fn new(config: &Config) -> Result<Self, DiscoveryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: &Config) -> Self {
        Self {
            http,
            api_base: format!("{}{}/", config.http_base_url(), config.key),
        }
    }

    fn room_url(&self, peer_id: &str, token: &str, suffix: &str) -> String {
        format!("{}{}/{}/room/{}", self.api_base, peer_id, token, suffix)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T, DiscoveryError> {
        debug!("GET {}", url);
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(DiscoveryError::UnexpectedResponse(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl RoomDiscovery for HttpRoomDiscovery {
    async fn room_members(&self, peer_id: &str, token: &str) -> Result<Vec<String>, DiscoveryError> {
        let room: RoomIdResponse = self.get_json(&self.room_url(peer_id, token, "id")).await?;
        if room.room_id.is_empty() {
            return Err(DiscoveryError::UnexpectedResponse("empty room id".into()));
        }
        let join_suffix = format!("{}/join", room.room_id);
        let joined: JoinRoomResponse = self.get_json(&self.room_url(peer_id, token, &join_suffix)).await?;
        Ok(joined.clients_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_urls() {
        let config = Config {
            signaling_server: "pnp.example.com".into(),
            port: 9779,
            secure: false,
            ..Config::default()
        };
        let discovery = HttpRoomDiscovery::with_client(reqwest::Client::new(), &config);
        assert_eq!(
            discovery.room_url("dev1", "tok", "id"),
            "http://pnp.example.com:9779/peerjs/dev1/tok/room/id"
        );
        assert_eq!(
            discovery.room_url("dev1", "tok", "r42/join"),
            "http://pnp.example.com:9779/peerjs/dev1/tok/room/r42/join"
        );
    }

    #[test]
    fn test_parse_room_responses() {
        let room: RoomIdResponse = serde_json::from_str(r#"{"roomId":"abc"}"#).unwrap();
        assert_eq!(room.room_id, "abc");
        let joined: JoinRoomResponse =
            serde_json::from_str(r#"{"clientsIds":["dev1","browser"]}"#).unwrap();
        assert_eq!(joined.clients_ids, vec!["dev1", "browser"]);
    }
}
