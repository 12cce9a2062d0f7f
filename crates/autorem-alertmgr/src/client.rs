use crate::{AlertManagerApi, ALERT_PATH};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const DEFAULT_OWNER: &str = "auto_remediator";
/// The alert manager expects a refresh within 30 seconds of expiry.
const REFRESH_LEAD_SECS: i64 = 20;
const REFRESH_ATTEMPTS: u32 = 3;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
    /// Unix seconds; arrives as a JSON number.
    expires_at: f64,
}

struct Inner {
    addr: String,
    owner: String,
    team: String,
    username: String,
    password: String,
    http: reqwest::Client,
    token: Mutex<String>,
}

/// Concrete HTTP client over the alert manager's REST API.
///
/// The bearer token is guarded by a mutex shared with the background
/// refresh task, so an in-flight `post_ack` never observes a half-swapped
/// token.
#[derive(Clone)]
pub struct AlertManager {
    inner: Arc<Inner>,
}

impl AlertManager {
    /// Authenticates against the alert manager and schedules the token
    /// refresh task. A login failure here is fatal to boot.
    pub async fn connect(
        addr: &str,
        user: &str,
        pass: &str,
        owner: &str,
        team: &str,
    ) -> Result<AlertManager> {
        let owner = if owner.is_empty() { DEFAULT_OWNER } else { owner };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("failed to build http client")?;
        let inner = Arc::new(Inner {
            addr: addr.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            team: team.to_string(),
            username: user.to_string(),
            password: pass.to_string(),
            http,
            token: Mutex::new(String::new()),
        });

        let auth = inner
            .login()
            .await
            .context("failed to talk to alert manager")?;
        *inner.token.lock().await = auth.token;
        tokio::spawn(refresh_loop(inner.clone(), auth.expires_at as i64));

        Ok(AlertManager { inner })
    }
}

impl Inner {
    async fn login(&self) -> Result<TokenResponse> {
        let body = serde_json::json!({
            "Username": self.username,
            "Password": self.password,
        });
        let resp = self
            .http
            .post(format!("{}/api/auth", self.addr))
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let auth: TokenResponse = resp.json().await?;
        if auth.token.is_empty() {
            return Err(anyhow!("failed to get token"));
        }
        Ok(auth)
    }

    /// One refresh round trip, holding the token mutex across the swap.
    async fn try_refresh(&self) -> Result<i64> {
        let mut token = self.token.lock().await;
        let resp = self
            .http
            .get(format!("{}/api/auth/refresh", self.addr))
            .bearer_auth(token.as_str())
            .send()
            .await?
            .error_for_status()?;
        let auth: TokenResponse = resp.json().await?;
        if auth.token.is_empty() {
            return Err(anyhow!("refresh returned an empty token"));
        }
        *token = auth.token;
        Ok(auth.expires_at as i64)
    }

    /// Refresh with bounded retry, then a full re-login as the fallback.
    async fn refresh_with_recovery(&self) -> Option<i64> {
        for attempt in 1..=REFRESH_ATTEMPTS {
            match self.try_refresh().await {
                Ok(expires_at) => return Some(expires_at),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "token refresh failed");
                    tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                }
            }
        }
        match self.login().await {
            Ok(auth) => {
                *self.token.lock().await = auth.token;
                tracing::info!("re-authenticated after failed token refresh");
                Some(auth.expires_at as i64)
            }
            Err(e) => {
                tracing::error!(error = %e, "re-login failed, token refresh loop stopping");
                None
            }
        }
    }
}

async fn refresh_loop(inner: Arc<Inner>, mut expires_at: i64) {
    loop {
        let delay = refresh_delay(expires_at, chrono::Utc::now().timestamp());
        tokio::time::sleep(delay).await;
        match inner.refresh_with_recovery().await {
            Some(next) => expires_at = next,
            None => return,
        }
    }
}

/// Seconds until the next refresh should run; clamps to zero when the
/// expiry (minus lead time) is already in the past.
pub(crate) fn refresh_delay(expires_at: i64, now: i64) -> Duration {
    let secs = expires_at - REFRESH_LEAD_SECS - now;
    Duration::from_secs(secs.max(0) as u64)
}

#[async_trait]
impl AlertManagerApi for AlertManager {
    async fn get_alerts(
        &self,
        url_suffix: &str,
    ) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
        let resp = self
            .inner
            .http
            .get(format!("{}{}", self.inner.addr, url_suffix))
            .send()
            .await?;
        resp.json().await.context("unable to decode json body")
    }

    async fn post_ack(&self, id: i64) -> Result<()> {
        let token = self.inner.token.lock().await;
        let url = format!(
            "{}{}/{}/ack?owner={}&team={}",
            self.inner.addr, ALERT_PATH, id, self.inner.owner, self.inner.team
        );
        self.inner
            .http
            .patch(url)
            .bearer_auth(token.as_str())
            .send()
            .await
            .with_context(|| format!("failed to patch alert {id}"))?
            .error_for_status()?;
        Ok(())
    }
}
