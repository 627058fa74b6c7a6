use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::burrow::access::{
    AccessError, AccessManager, ApiError, ServerCommand, ServerConfig, ServerInfo, ServerStatus,
    SessionRequestEx, SessionResponseEx,
};
use crate::burrow::protocol::{SessionResponse, Traffic};

#[derive(Debug, Clone)]
pub struct HttpAccessManagerOptions {
    pub base_url: String,
    /// Bearer token for the management API.
    pub auth_token: String,
    pub request_timeout: Duration,
}

/// Client for the HTTP access-manager API.
pub struct HttpAccessManager {
    client: reqwest::Client,
    options: HttpAccessManagerOptions,
}

impl HttpAccessManager {
    pub fn new(options: HttpAccessManagerOptions) -> Result<Self, AccessError> {
        let client = reqwest::Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Ok(Self { client, options })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.options.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.options.auth_token)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, AccessError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|e| AccessError::Network(e.to_string()));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(AccessError::NotFound);
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            return Err(AccessError::Maintenance);
        }
        let error: ApiError = response.json().await.unwrap_or_default();
        Err(AccessError::Api {
            status: status.as_u16(),
            error,
        })
    }
}

#[async_trait]
impl AccessManager for HttpAccessManager {
    async fn server_configure(&self, info: ServerInfo) -> Result<ServerConfig, AccessError> {
        let resp = self
            .request(reqwest::Method::POST, "configure")
            .json(&info)
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn server_status(&self, status: ServerStatus) -> Result<ServerCommand, AccessError> {
        let resp = self
            .request(reqwest::Method::POST, "status")
            .json(&status)
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn session_create(
        &self,
        request: SessionRequestEx,
    ) -> Result<SessionResponseEx, AccessError> {
        let resp = self
            .request(reqwest::Method::POST, "sessions")
            .json(&request)
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn session_get(
        &self,
        session_id: u64,
        host_end_point: SocketAddr,
        client_ip: Option<IpAddr>,
    ) -> Result<SessionResponseEx, AccessError> {
        let mut req = self
            .request(reqwest::Method::GET, &format!("sessions/{session_id}"))
            .query(&[("hostEndPoint", host_end_point.to_string())]);
        if let Some(ip) = client_ip {
            req = req.query(&[("clientIp", ip.to_string())]);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn add_usage(
        &self,
        session_id: u64,
        traffic: Traffic,
        close: bool,
    ) -> Result<SessionResponse, AccessError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("sessions/{session_id}/usage"),
            )
            .query(&[("closeSession", close.to_string())])
            .json(&traffic)
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Self::decode(resp).await
    }

    async fn certificate_get(&self, host_end_point: SocketAddr) -> Result<Vec<u8>, AccessError> {
        let resp = self
            .request(
                reqwest::Method::GET,
                &format!("certificates/{host_end_point}"),
            )
            .send()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let error: ApiError = resp.json().await.unwrap_or_default();
            return Err(AccessError::Api {
                status: status.as_u16(),
                error,
            });
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| AccessError::Network(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_join_strips_trailing_slash() {
        let mgr = HttpAccessManager::new(HttpAccessManagerOptions {
            base_url: "https://manager.example.org/api/".into(),
            auth_token: "t".into(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        assert_eq!(
            mgr.url("sessions/42/usage"),
            "https://manager.example.org/api/sessions/42/usage"
        );
    }
}
