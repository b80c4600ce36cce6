use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::{FenceError, FenceResult};
use crate::models::{ApprovedSchedule, BlockEntry, BlockStatus};
use crate::server::{BlocklistBody, EndDateBody, ScheduleIdBody, StartBlockBody, StartScheduledBody, VersionReply};

/// Typed client for the daemon's IPC surface, used by the agent and the
/// CLI subcommands. The control token is read from disk at construction;
/// it is absent until the daemon's first run, which only locks out the
/// authorized routes.
pub struct DaemonClient {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl DaemonClient {
    pub fn from_config(config: &Config) -> Self {
        let token = std::fs::read_to_string(config.token_file())
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        Self {
            base_url: config.daemon_url(),
            token,
            http: reqwest::Client::new(),
        }
    }

    fn token(&self) -> FenceResult<&str> {
        self.token.as_deref().ok_or(FenceError::AuthorizationDenied)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B, authorized: bool) -> FenceResult<()> {
        let mut request = self.http.post(format!("{}{path}", self.base_url)).json(body);
        if authorized {
            request = request.bearer_auth(self.token()?);
        }
        let response = request.send().await.map_err(unreachable_daemon)?;
        expect_success(response).await.map(|_| ())
    }

    pub async fn version(&self) -> FenceResult<String> {
        let response = self
            .http
            .get(format!("{}/v1/version", self.base_url))
            .send()
            .await
            .map_err(unreachable_daemon)?;
        let body = expect_success(response).await?;
        let reply: VersionReply =
            serde_json::from_str(&body).map_err(|e| FenceError::Transient(format!("parsing version reply: {e}")))?;
        Ok(reply.version)
    }

    pub async fn status(&self) -> FenceResult<BlockStatus> {
        let response = self
            .http
            .get(format!("{}/v1/block/status", self.base_url))
            .send()
            .await
            .map_err(unreachable_daemon)?;
        let body = expect_success(response).await?;
        serde_json::from_str(&body).map_err(|e| FenceError::Transient(format!("parsing status reply: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn start_block(
        &self,
        controlling_uid: u32,
        blocklist: Vec<BlockEntry>,
        is_allowlist: bool,
        end_date: DateTime<Utc>,
        settings: crate::models::BlockSettings,
        is_test: bool,
    ) -> FenceResult<()> {
        let body = StartBlockBody {
            controlling_uid,
            blocklist,
            is_allowlist,
            end_date,
            settings,
            is_test,
        };
        self.post("/v1/block/start", &body, true).await
    }

    pub async fn update_blocklist(&self, blocklist: Vec<BlockEntry>) -> FenceResult<()> {
        self.post("/v1/block/blocklist", &BlocklistBody { blocklist }, true).await
    }

    pub async fn update_end_date(&self, end_date: DateTime<Utc>) -> FenceResult<()> {
        self.post("/v1/block/end-date", &EndDateBody { end_date }, true).await
    }

    pub async fn register_schedule(&self, schedule: &ApprovedSchedule) -> FenceResult<()> {
        self.post("/v1/schedules/register", schedule, true).await
    }

    pub async fn start_scheduled(&self, schedule_id: &str, end_date: DateTime<Utc>) -> FenceResult<()> {
        let body = StartScheduledBody {
            schedule_id: schedule_id.to_string(),
            end_date,
        };
        self.post("/v1/schedules/start", &body, false).await
    }

    pub async fn unregister_schedule(&self, schedule_id: &str) -> FenceResult<()> {
        let body = ScheduleIdBody {
            schedule_id: schedule_id.to_string(),
        };
        self.post("/v1/schedules/unregister", &body, true).await
    }

    pub async fn cleanup_stale_schedule(&self, schedule_id: &str) -> FenceResult<()> {
        let body = ScheduleIdBody {
            schedule_id: schedule_id.to_string(),
        };
        self.post("/v1/schedules/cleanup-stale", &body, false).await
    }

    pub async fn stop_test_block(&self) -> FenceResult<()> {
        self.post("/v1/block/stop-test", &serde_json::json!({}), false).await
    }

    pub async fn clear_expired_block(&self) -> FenceResult<()> {
        self.post("/v1/block/clear-expired", &serde_json::json!({}), false).await
    }

    #[cfg(debug_assertions)]
    pub async fn clear_block_for_debug(&self) -> FenceResult<()> {
        self.post("/v1/block/clear-debug", &serde_json::json!({}), true).await
    }
}

fn unreachable_daemon(e: reqwest::Error) -> FenceError {
    FenceError::Transient(format!("daemon unreachable: {e}"))
}

async fn expect_success(response: reqwest::Response) -> FenceResult<String> {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if status.is_success() {
        Ok(body)
    } else {
        Err(FenceError::from_status(status.as_u16(), body))
    }
}
