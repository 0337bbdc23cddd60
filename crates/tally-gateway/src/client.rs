//! HTTP implementation of the gateway adapter.
//!
//! Requests carry a shared admin credential header; bodies and responses
//! are JSON with a `{code, message, data}` envelope. Non-zero envelope
//! codes are errors.

use std::time::Duration;

use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use tally_common::config::GatewayConfig;
use tally_common::{EmployeeNumber, TallyError, TallyResult, UserId};

use crate::Gateway;

/// Response envelope used by every gateway endpoint.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    #[serde(default)]
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct QuotaValue {
    value: i64,
}

/// Gateway client over HTTP.
///
/// Stateless after construction; safe to share across tasks.
pub struct HttpGateway {
    http: reqwest::Client,
    base_url: String,
    admin_path: String,
    credential_header: String,
    credential: String,
}

impl HttpGateway {
    /// Build a client from configuration. Applies the per-call timeout
    /// (30 s by default) at the `reqwest` client level.
    pub fn new(config: &GatewayConfig) -> TallyResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| TallyError::Configuration(format!("gateway client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            admin_path: config.admin_path.clone(),
            credential_header: config.credential_header.clone(),
            credential: config.credential.expose_secret().clone(),
        })
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}{}", self.base_url, self.admin_path, suffix)
    }

    /// POST a JSON body and decode the envelope.
    ///
    /// Network failures and 5xx responses are transient; 4xx responses and
    /// non-zero envelope codes are permanent.
    async fn post<T: DeserializeOwned, B: Serialize + Sync>(
        &self,
        suffix: &str,
        body: &B,
    ) -> TallyResult<Option<T>> {
        let url = self.url(suffix);
        let response = self
            .http
            .post(&url)
            .header(&self.credential_header, &self.credential)
            .json(body)
            .send()
            .await
            .map_err(|e| TallyError::GatewayTransient(format!("{url}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(TallyError::GatewayTransient(format!("{url}: HTTP {status}")));
        }
        if status.is_client_error() {
            return Err(TallyError::GatewayPermanent(format!("{url}: HTTP {status}")));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| TallyError::GatewayTransient(format!("{url}: decode: {e}")))?;

        if envelope.code != 0 {
            warn!(code = envelope.code, message = %envelope.message, %url, "gateway rejected request");
            return Err(TallyError::GatewayPermanent(format!(
                "{url}: code {}: {}",
                envelope.code, envelope.message
            )));
        }

        debug!(%url, "gateway call ok");
        Ok(envelope.data)
    }

    async fn post_unit<B: Serialize + Sync>(&self, suffix: &str, body: &B) -> TallyResult<()> {
        self.post::<serde_json::Value, _>(suffix, body).await?;
        Ok(())
    }

    async fn post_value<B: Serialize + Sync>(&self, suffix: &str, body: &B) -> TallyResult<i64> {
        let data: Option<QuotaValue> = self.post(suffix, body).await?;
        data.map(|v| v.value)
            .ok_or_else(|| TallyError::GatewayPermanent(format!("{suffix}: missing data")))
    }
}

impl Gateway for HttpGateway {
    #[instrument(name = "gateway.set_quota", skip(self))]
    async fn set_quota(&self, user: UserId, value: i64) -> TallyResult<()> {
        self.post_unit("/set", &json!({ "user_id": user, "value": value }))
            .await
    }

    #[instrument(name = "gateway.delta_quota", skip(self))]
    async fn delta_quota(&self, user: UserId, delta: i64) -> TallyResult<()> {
        self.post_unit("/delta", &json!({ "user_id": user, "delta": delta }))
            .await
    }

    #[instrument(name = "gateway.query_quota_value", skip(self))]
    async fn query_quota_value(&self, user: UserId) -> TallyResult<i64> {
        self.post_value("/query", &json!({ "user_id": user })).await
    }

    #[instrument(name = "gateway.delta_used_quota", skip(self))]
    async fn delta_used_quota(&self, user: UserId, delta: i64) -> TallyResult<()> {
        if delta < 0 {
            return Err(TallyError::InvalidInput(
                "usage delta must be non-negative".to_string(),
            ));
        }
        self.post_unit("/used/delta", &json!({ "user_id": user, "delta": delta }))
            .await
    }

    #[instrument(name = "gateway.query_used_quota", skip(self))]
    async fn query_used_quota(&self, user: UserId) -> TallyResult<i64> {
        self.post_value("/used/query", &json!({ "user_id": user }))
            .await
    }

    #[instrument(name = "gateway.set_models", skip(self, models))]
    async fn set_models(&self, employee: &EmployeeNumber, models: &[String]) -> TallyResult<()> {
        self.post_unit(
            "/models",
            &json!({
                "employee_number": employee,
                "models": models,
                "operation": "set",
            }),
        )
        .await
    }

    #[instrument(name = "gateway.set_star_check", skip(self))]
    async fn set_star_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()> {
        self.post_unit(
            "/star-check",
            &json!({
                "employee_number": employee,
                "enabled": enabled,
                "operation": "set",
            }),
        )
        .await
    }

    #[instrument(name = "gateway.set_quota_check", skip(self))]
    async fn set_quota_check(&self, employee: &EmployeeNumber, enabled: bool) -> TallyResult<()> {
        self.post_unit(
            "/quota-check",
            &json!({
                "employee_number": employee,
                "enabled": enabled,
                "operation": "set",
            }),
        )
        .await
    }
}
