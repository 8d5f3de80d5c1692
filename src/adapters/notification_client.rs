//! Sends up/down/takeout commands to a gateway's cluster manager endpoint.
use bytes::Bytes;
use eyre::{Result, WrapErr, eyre};
use http::{Method, Request, StatusCode};

use crate::{
    adapters::HttpClientAdapter,
    core::{
        balancer::{
            ClusterCommand,
            command::{CommandCipher, CommandSigner},
        },
        exchange::Exchange,
    },
    ports::http_client::HttpClient,
};

pub struct NotificationClient {
    cluster_manager_url: String,
    client: HttpClientAdapter,
    cipher: Option<CommandCipher>,
    signer: Option<CommandSigner>,
}

impl NotificationClient {
    /// `cluster_manager_url` is the absolute URL of the endpoint prefix,
    /// e.g. `http://gateway:8080/clustermanager`.
    pub fn new(cluster_manager_url: impl Into<String>, client: HttpClientAdapter) -> Self {
        Self {
            cluster_manager_url: cluster_manager_url.into().trim_end_matches('/').to_string(),
            client,
            cipher: None,
            signer: None,
        }
    }

    /// Send commands as an encrypted `data` parameter.
    pub fn with_key_hex(mut self, key: &str) -> Result<Self> {
        self.cipher = Some(CommandCipher::from_hex(key).wrap_err("Invalid notification key")?);
        Ok(self)
    }

    pub fn with_hmac_secret(mut self, secret: impl AsRef<[u8]>) -> Result<Self> {
        self.signer = Some(CommandSigner::new(secret).wrap_err("Invalid HMAC secret")?);
        Ok(self)
    }

    /// The URL a command is sent to.
    pub fn command_url(&self, command: &ClusterCommand) -> Result<String> {
        let mut command = command.clone();
        if self.cipher.is_some() && command.nonce.is_none() {
            command.nonce = Some(uuid::Uuid::new_v4().to_string());
        }

        let mut query = command.to_query();
        if let Some(signer) = &self.signer {
            query.push_str("&signature=");
            query.push_str(&signer.sign(&command.signing_payload()));
        }
        if let Some(cipher) = &self.cipher {
            let data = cipher.encrypt(&query).wrap_err("Failed to encrypt command")?;
            query = format!("data={}", urlencoding::encode(&data));
        }
        Ok(format!("{}/{}?{}", self.cluster_manager_url, command.kind, query))
    }

    /// Deliver a command; anything but 204 is an error.
    pub async fn send(&self, command: &ClusterCommand) -> Result<()> {
        let url = self.command_url(command)?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(url.as_str())
            .body(Bytes::new())
            .wrap_err_with(|| format!("Invalid command URL {url}"))?;

        let mut exc = Exchange::new(request);
        exc.set_destinations(vec![url.clone()]);
        self.client
            .call(&mut exc)
            .await
            .wrap_err_with(|| format!("Failed to reach cluster manager at {}", self.cluster_manager_url))?;

        let response = exc
            .response()
            .ok_or_else(|| eyre!("cluster manager sent no response"))?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(eyre!(
                "cluster manager answered {}: {}",
                response.status(),
                String::from_utf8_lossy(response.body())
            ));
        }
        tracing::info!(
            command = %command.kind,
            balancer = %command.balancer,
            cluster = %command.cluster,
            host = %command.host,
            port = command.port,
            "cluster command accepted"
        );
        Ok(())
    }
}
