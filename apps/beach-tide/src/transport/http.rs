use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{CommandAck, SessionApi, SessionSummary, TransportError, endpoint_url};
use crate::config::SyncConfig;

/// `SessionApi` over plain HTTP with reqwest.
pub struct HttpSessionApi {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpSessionApi {
    pub fn new(config: &SyncConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.server.clone(),
            bearer_token: config.token.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        endpoint_url(&self.base_url, segments)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.bearer_token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn deliver(
        &self,
        session: &str,
        action: &str,
        payload: &str,
    ) -> Result<CommandAck, TransportError> {
        let endpoint = self.endpoint(&["sessions", session, action])?;
        let request = CommandRequest { payload };
        let response = self
            .authorize(self.client.post(endpoint))
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let CommandResponse { ok, message, tail } = response.json().await?;
        if !ok {
            return Err(TransportError::Rejected(
                message.unwrap_or_else(|| "command rejected".to_string()),
            ));
        }
        Ok(CommandAck { message, tail })
    }
}

#[async_trait]
impl SessionApi for HttpSessionApi {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>, TransportError> {
        let endpoint = self.endpoint(&["sessions"])?;
        let response = self.authorize(self.client.get(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let payload = response.json::<DirectoryResponse>().await?;
        Ok(payload.sessions)
    }

    async fn fetch_tail(&self, session: &str, lines: usize) -> Result<String, TransportError> {
        let mut endpoint = self.endpoint(&["sessions", session, "tail"])?;
        endpoint
            .query_pairs_mut()
            .append_pair("lines", &lines.to_string());
        let response = self.authorize(self.client.get(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        let payload = response.json::<TailResponse>().await?;
        Ok(payload.output)
    }

    async fn send_prompt(
        &self,
        session: &str,
        payload: &str,
    ) -> Result<CommandAck, TransportError> {
        self.deliver(session, "prompt", payload).await
    }

    async fn exec_shell(&self, session: &str, payload: &str) -> Result<CommandAck, TransportError> {
        self.deliver(session, "exec", payload).await
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let endpoint = self.endpoint(&["health"])?;
        let response = self.authorize(self.client.get(endpoint)).send().await?;
        if !response.status().is_success() {
            return Err(TransportError::HttpStatus(response.status()));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    payload: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommandResponse {
    #[serde(default = "default_ok")]
    ok: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    tail: Option<String>,
}

fn default_ok() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct DirectoryResponse {
    #[serde(default)]
    sessions: Vec<SessionSummary>,
}

#[derive(Debug, Deserialize)]
struct TailResponse {
    #[serde(default)]
    output: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_stay_under_base_path() {
        let config = SyncConfig::new("https://relay.beach.sh/api").unwrap();
        let api = HttpSessionApi::new(&config).unwrap();
        assert_eq!(
            api.endpoint(&["sessions", "s1", "tail"]).unwrap().as_str(),
            "https://relay.beach.sh/api/sessions/s1/tail"
        );
    }

    #[test]
    fn session_ids_are_encoded_as_one_segment() {
        let config = SyncConfig::new("https://relay.beach.sh/api").unwrap();
        let api = HttpSessionApi::new(&config).unwrap();

        let url = api
            .endpoint(&["sessions", "x?lines=1#/tail", "tail"])
            .unwrap();
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());
        assert_eq!(url.path_segments().unwrap().count(), 4);
        assert!(url.path().starts_with("/api/sessions/x%3Flines=1%23"));
        assert!(url.path().ends_with("/tail"));

        let url = api
            .endpoint(&["sessions", "../../admin/exec", "exec"])
            .unwrap();
        assert_eq!(url.host_str(), Some("relay.beach.sh"));
        assert!(url.path().starts_with("/api/sessions/"));
        assert_eq!(url.path_segments().unwrap().count(), 4);

        assert!(matches!(
            api.endpoint(&["sessions", "..", "tail"]),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(api.endpoint(&["sessions", "", "tail"]).is_err());
    }

    #[test]
    fn command_response_defaults_to_ok() {
        let parsed: CommandResponse = serde_json::from_str(r#"{"tail":"done\n"}"#).unwrap();
        assert!(parsed.ok);
        assert_eq!(parsed.tail.as_deref(), Some("done\n"));

        let rejected: CommandResponse =
            serde_json::from_str(r#"{"ok":false,"message":"session is read-only"}"#).unwrap();
        assert!(!rejected.ok);
    }
}
