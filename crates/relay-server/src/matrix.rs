use relay_contracts::RoomMessage;
use relay_kernel::formatted_body;
use reqwest::{Client, Url};
use tracing::debug;

const SEND_PATH: [&str; 4] = ["_matrix", "client", "r0", "rooms"];

pub struct MatrixClient {
    client: Client,
    host: Url,
    access_token: String,
}

impl MatrixClient {
    pub fn new(cfg: &relay_config::Matrix) -> Result<Self, String> {
        let client = Client::builder().build().map_err(|e| e.to_string())?;
        let host = Url::parse(&cfg.host).map_err(|e| format!("invalid matrix host: {e}"))?;
        if host.cannot_be_a_base() {
            return Err(format!("invalid matrix host: {host}"));
        }
        Ok(Self {
            client,
            host,
            access_token: cfg.access_token.clone(),
        })
    }

    /// Send URL for `room`; the room id is percent-encoded as one path segment.
    pub fn room_url(&self, room: &str) -> Url {
        let mut url = self.host.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(SEND_PATH)
                .extend([room, "send", "m.room.message"]);
        }
        url.query_pairs_mut()
            .append_pair("access_token", &self.access_token);
        url
    }

    /// Posts `text` (plus a references footer) to `room`. One attempt only.
    pub async fn emit(&self, text: &str, room: &str, references: &[String]) -> Result<(), String> {
        let message = RoomMessage::html(text.to_string(), formatted_body(text, references));
        let response = self
            .client
            .post(self.room_url(room))
            .json(&message)
            .send()
            .await
            .map_err(|e| format!("send to {room} failed: {e}"))?;
        let status = response.status();
        debug!(%room, %status, "message posted");
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(format!("send to {room} returned {status}: {body}"));
        }
        Ok(())
    }
}
