//! Upstream metadata service client
//!
//! Thin blocking HTTP layer over the couch-style API the upstream exposes.
//! Every request carries basic auth from the opaque credential blob, a
//! randomly chosen load-balancer cookie and compressed-transfer accept
//! headers. Response bodies pass through a schema-bug preprocessor before
//! parsing; anything that still refuses to parse is quarantined to disk so
//! it can be analysed later, and the calling task fails gracefully.

pub mod types;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use base64::Engine;
use rand::Rng;
use regex::Regex;
use serde::de::DeserializeOwned;

use weft_core::model::{JamId, RiffId, StemId};

use crate::config::{ApiConfig, Auth};
use types::{
    AllDocsResponse, ChangesResponse, JamProfileDoc, RiffDocument, SharedRiffsResponse,
    StemDocument, TypeCheckDocument, ViewResponse,
};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no upstream credentials configured")]
    NoAuth,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request returned status {0}")]
    Status(u16),
    #[error("response parse failed ({context}); body quarantined to {quarantined}")]
    Parse { context: String, quarantined: String },
}

/// Which identity string a request presents.
#[derive(Debug, Clone, Copy)]
pub enum UserAgent {
    App,
    Couch,
}

pub struct ApiClient {
    config: ApiConfig,
    auth: Auth,
    quarantine_dir: PathBuf,
    quarantine_index: AtomicU32,
    length_fix: Regex,
}

impl ApiClient {
    pub fn new(config: ApiConfig, auth: Auth, quarantine_dir: PathBuf) -> Self {
        Self {
            config,
            auth,
            quarantine_dir,
            quarantine_index: AtomicU32::new(0),
            // one upstream release wrote "length" values as strings; patch
            // them back to numbers before the parser sees them
            length_fix: Regex::new(r#""length"\s*:\s*"(\d+)""#).expect("static regex"),
        }
    }

    pub fn has_auth(&self) -> bool {
        self.auth.is_configured()
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    // ── endpoints ──────────────────────────────────────────────────────────

    pub fn jam_profile(&self, jam: &JamId) -> Result<JamProfileDoc, ApiError> {
        let path = format!("/user_appdata${jam}/Profile");
        self.get_json(&path, UserAgent::Couch, &format!("jam_profile({jam})"))
    }

    /// Latest change marker for a jam; one row, newest first.
    pub fn jam_latest_change(&self, jam: &JamId) -> Result<ChangesResponse, ApiError> {
        let path = format!("/user_appdata${jam}/_changes?descending=true&limit=1");
        let body = r#"{ "feed": "normal", "style": "all_docs", "active_only": true }"#;
        self.post_json(&path, body, UserAgent::Couch, &format!("jam_latest_change({jam})"))
    }

    /// Delta stream of changes after a known sequence marker.
    pub fn jam_changes_since(&self, jam: &JamId, seq: &str) -> Result<ChangesResponse, ApiError> {
        let path = format!("/user_appdata${jam}/_changes?since={seq}");
        let body = r#"{ "feed": "normal", "style": "all_docs", "active_only": true }"#;
        self.post_json(&path, body, UserAgent::Couch, &format!("jam_changes_since({jam})"))
    }

    /// The complete ordered list of riff ids in a jam.
    pub fn jam_full_snapshot(&self, jam: &JamId) -> Result<ViewResponse, ApiError> {
        let path =
            format!("/user_appdata${jam}/_design/types/_view/rifffLoopsByCreateTime?descending=true");
        self.get_json(&path, UserAgent::Couch, &format!("jam_full_snapshot({jam})"))
    }

    /// Riff count only; the view's `total_rows` without any row data.
    pub fn jam_riff_count(&self, jam: &JamId) -> Result<u64, ApiError> {
        let path = format!("/user_appdata${jam}/_design/types/_view/rifffsByCreateTime?limit=0");
        let response: ViewResponse =
            self.get_json(&path, UserAgent::Couch, &format!("jam_riff_count({jam})"))?;
        Ok(response.total_rows)
    }

    /// Full metadata documents for a batch of riffs.
    pub fn riff_details(
        &self,
        jam: &JamId,
        riff_ids: &[RiffId],
    ) -> Result<AllDocsResponse<RiffDocument>, ApiError> {
        self.all_docs(jam, riff_ids.iter().map(RiffId::as_str), "riff_details")
    }

    /// Minimal validation documents for a batch of stems.
    pub fn stem_type_check(
        &self,
        jam: &JamId,
        stem_ids: &[StemId],
    ) -> Result<AllDocsResponse<TypeCheckDocument>, ApiError> {
        self.all_docs(jam, stem_ids.iter().map(StemId::as_str), "stem_type_check")
    }

    /// Full metadata documents for a batch of stems.
    pub fn stem_details(
        &self,
        jam: &JamId,
        stem_ids: &[StemId],
    ) -> Result<AllDocsResponse<StemDocument>, ApiError> {
        self.all_docs(jam, stem_ids.iter().map(StemId::as_str), "stem_details")
    }

    /// Resolve one publicly shared riff by its share id. This endpoint backs
    /// the public website and tolerates missing credentials.
    pub fn shared_riff_by_id(&self, share_id: &str) -> Result<SharedRiffsResponse, ApiError> {
        let path = format!("/api/v3/feed/shared_by_id/{share_id}");
        self.get_json(&path, UserAgent::App, &format!("shared_riff_by_id({share_id})"))
    }

    // ── plumbing ───────────────────────────────────────────────────────────

    fn all_docs<'a, T: DeserializeOwned>(
        &self,
        jam: &JamId,
        keys: impl Iterator<Item = &'a str>,
        context: &str,
    ) -> Result<AllDocsResponse<T>, ApiError> {
        let path = format!("/user_appdata${jam}/_all_docs?include_docs=true");
        let body = serde_json::json!({ "keys": keys.collect::<Vec<_>>() }).to_string();
        self.post_json(&path, &body, UserAgent::Couch, &format!("{context}({jam})"))
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        ua: UserAgent,
        context: &str,
    ) -> Result<T, ApiError> {
        let body = self.execute(path, None, ua)?;
        self.parse_payload(&body, context)
    }

    fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &str,
        ua: UserAgent,
        context: &str,
    ) -> Result<T, ApiError> {
        let body = self.execute(path, Some(body), ua)?;
        self.parse_payload(&body, context)
    }

    /// Issue one request with the standard header set, retrying transport
    /// failures up to the configured limit with a little jitter.
    fn execute(&self, path: &str, body: Option<&str>, ua: UserAgent) -> Result<String, ApiError> {
        if !self.has_auth() {
            return Err(ApiError::NoAuth);
        }

        let url = format!("https://{}{}", self.config.data_domain, path);
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(u64::from(self.config.timeout_secs())))
            .timeout(Duration::from_secs(u64::from(self.config.timeout_secs()) * 5))
            .build();

        let user_agent = match ua {
            UserAgent::App => &self.config.user_agent_app,
            UserAgent::Couch => &self.config.user_agent_db,
        };
        let auth_header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD
                .encode(format!("{}:{}", self.auth.token, self.auth.password))
        );

        let mut last_error = String::new();
        let attempts = self.config.retry_limit().max(1);

        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = rand::thread_rng().gen_range(150..=450) * u64::from(attempt);
                std::thread::sleep(Duration::from_millis(backoff));
            }

            let request = agent
                .request(if body.is_some() { "POST" } else { "GET" }, &url)
                .set("Host", &self.config.data_domain)
                .set("User-Agent", user_agent)
                .set("Authorization", &auth_header)
                .set("Cookie", &generate_load_balancer_cookie())
                .set("Accept", "application/json")
                .set("Accept-Language", "en-gb");

            let result = match body {
                Some(payload) => request
                    .set("Content-Type", "application/json")
                    .send_string(payload),
                None => request.call(),
            };

            match result {
                Ok(response) => {
                    return response
                        .into_string()
                        .map_err(|err| ApiError::Transport(err.to_string()));
                }
                Err(ureq::Error::Status(code, _)) => {
                    log::error!("HTTP {code} from {path}");
                    return Err(ApiError::Status(code));
                }
                Err(err) => {
                    last_error = err.to_string();
                    log::warn!("transport error on {path} (attempt {}): {last_error}", attempt + 1);
                }
            }
        }

        Err(ApiError::Transport(last_error))
    }

    /// Preprocess and parse a response body; quarantine anything unparseable.
    fn parse_payload<T: DeserializeOwned>(&self, body: &str, context: &str) -> Result<T, ApiError> {
        let repaired = self.length_fix.replace_all(body, r#""length":$1"#);

        match serde_json::from_str::<T>(&repaired) {
            Ok(value) => Ok(value),
            Err(err) => {
                let quarantined = self.quarantine(context, &err.to_string(), &repaired);
                log::error!("JSON parse failed in {context}: {err}");
                log::error!("problematic body saved to [{}]", quarantined.display());
                Err(ApiError::Parse {
                    context: context.to_owned(),
                    quarantined: quarantined.display().to_string(),
                })
            }
        }
    }

    fn quarantine(&self, context: &str, error: &str, body: &str) -> PathBuf {
        let _ = std::fs::create_dir_all(&self.quarantine_dir);

        let index = self.quarantine_index.fetch_add(1, Ordering::Relaxed);
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        let sanitised: String = context
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let path = self.quarantine_dir.join(format!("{stamp}.{index}.{sanitised}.json"));

        let payload = format!("{error}\n\n{context}\n\n{body}\n");
        if let Err(err) = std::fs::write(&path, payload) {
            log::error!("failed to write quarantine file: {err}");
        }
        path
    }
}

/// Randomised load-balancer pin of the form `LB=liveNN`, NN in 01..=07.
pub fn generate_load_balancer_cookie() -> String {
    let index = rand::thread_rng().gen_range(1..=7);
    format!("LB=live{index:02}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> (ApiClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let auth = Auth { token: "user".into(), password: "pass".into() };
        let client = ApiClient::new(ApiConfig::default(), auth, dir.path().to_path_buf());
        (client, dir)
    }

    #[test]
    fn test_lb_cookie_shape() {
        for _ in 0..64 {
            let cookie = generate_load_balancer_cookie();
            assert!(cookie.starts_with("LB=live0"), "unexpected cookie {cookie}");
            let n: u32 = cookie["LB=live".len()..].parse().unwrap();
            assert!((1..=7).contains(&n));
        }
    }

    #[test]
    fn test_length_string_bug_is_repaired() {
        let (client, _dir) = test_client();
        let body = r#"{ "endpoint": "x", "url": "", "length": "12345", "mime": "audio/ogg" }"#;
        let parsed: types::AudioAttachment = client.parse_payload(body, "test").unwrap();
        assert_eq!(parsed.length, 12345);
    }

    #[test]
    fn test_unparseable_body_is_quarantined() {
        let (client, dir) = test_client();
        let result: Result<types::JamProfileDoc, _> =
            client.parse_payload("{ not even json", "broken_fetch");
        let err = result.unwrap_err();
        assert!(matches!(err, ApiError::Parse { .. }));

        let quarantined: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(quarantined.len(), 1);
        let contents =
            std::fs::read_to_string(quarantined[0].as_ref().unwrap().path()).unwrap();
        assert!(contents.contains("broken_fetch"));
        assert!(contents.contains("not even json"));
    }

    #[test]
    fn test_requests_refused_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let client =
            ApiClient::new(ApiConfig::default(), Auth::default(), dir.path().to_path_buf());
        let err = client.jam_profile(&JamId::from("band_x")).unwrap_err();
        assert!(matches!(err, ApiError::NoAuth));
    }
}
