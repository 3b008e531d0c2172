//! Authenticated session client for the target API.
//!
//! Owns the access token, CSRF token and session cookie set acquired during
//! the login handshake.  After `authenticate` completes the client is only
//! used through `&self`; nothing on the request path mutates session state,
//! so a batch of concurrent lookups can share one instance freely.

use reqwest::header::SET_COOKIE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::query::{listing_expr, Query};
use crate::{AppConfig, Entity, EntityKind};

/// Errors surfaced by the session client.  Every variant is fatal to the
/// test run: if the harness cannot authenticate or list entities there is
/// nothing meaningful to measure.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{context} request failed: {source}")]
    Http {
        context: &'static str,
        #[source]
        source: reqwest::Error,
    },
    #[error("{context} returned {status}: {body}")]
    Status {
        context: &'static str,
        status: StatusCode,
        body: String,
    },
    #[error("{context} response missing '{field}': {body}")]
    MissingField {
        context: &'static str,
        field: &'static str,
        body: String,
    },
    #[error("{context} returned an empty result")]
    EmptyResult { context: &'static str },
}

#[derive(Deserialize)]
struct LoginResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct CsrfResponse {
    result: Option<String>,
}

/// Session client wrapping one shared HTTP connection pool.
pub struct SessionClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    access_token: Option<String>,
    csrf_token: Option<String>,
    cookies: Vec<(String, String)>,
}

impl SessionClient {
    pub fn new(cfg: &AppConfig) -> Self {
        SessionClient {
            http: reqwest::Client::new(),
            base_url: cfg.base_url.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            access_token: None,
            csrf_token: None,
            cookies: Vec::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full login handshake: bearer token, CSRF token, session cookie, then
    /// a `me` probe to confirm the session took effect.
    pub async fn authenticate(&mut self) -> Result<(), ClientError> {
        self.login().await?;
        self.fetch_csrf().await?;
        self.establish_session().await;
        let user = self.current_user().await?;
        tracing::info!(user = %user, "session established");
        Ok(())
    }

    /// POST the credentials and store the bearer token.
    pub async fn login(&mut self) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/security/login", self.base_url);
        let payload = serde_json::json!({
            "password": self.password,
            "provider": "db",
            "username": self.username,
        });
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|source| ClientError::Http {
                context: "login",
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                context: "login",
                status,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body = resp.text().await.map_err(|source| ClientError::Http {
            context: "login",
            source,
        })?;
        let parsed: LoginResponse =
            serde_json::from_str(&body).map_err(|_| ClientError::MissingField {
                context: "login",
                field: "access_token",
                body: body.clone(),
            })?;
        match parsed.access_token {
            Some(token) if !token.is_empty() => {
                self.access_token = Some(token);
                Ok(())
            }
            _ => Err(ClientError::MissingField {
                context: "login",
                field: "access_token",
                body,
            }),
        }
    }

    /// Fetch the CSRF token with the bearer header and capture the cookies
    /// the endpoint hands back.
    pub async fn fetch_csrf(&mut self) -> Result<(), ClientError> {
        let url = format!("{}/api/v1/security/csrf_token/", self.base_url);
        let mut rb = self.http.get(&url);
        if let Some(token) = &self.access_token {
            rb = rb.bearer_auth(token);
        }
        if let Some(cookie) = self.cookie_header() {
            rb = rb.header(reqwest::header::COOKIE, cookie);
        }
        let resp = rb.send().await.map_err(|source| ClientError::Http {
            context: "csrf_token",
            source,
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                context: "csrf_token",
                status,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let cookies = response_cookies(&resp);
        let body = resp.text().await.map_err(|source| ClientError::Http {
            context: "csrf_token",
            source,
        })?;
        let parsed: CsrfResponse =
            serde_json::from_str(&body).map_err(|_| ClientError::MissingField {
                context: "csrf_token",
                field: "result",
                body: body.clone(),
            })?;
        match parsed.result {
            Some(token) if !token.is_empty() => {
                self.csrf_token = Some(token);
                if !cookies.is_empty() {
                    self.cookies = cookies;
                }
                Ok(())
            }
            _ => Err(ClientError::MissingField {
                context: "csrf_token",
                field: "result",
                body,
            }),
        }
    }

    /// Exchange CSRF token and credentials for the full session cookie set
    /// via the form login endpoint.  Deliberately unvalidated: several API
    /// calls work without a session cookie, so a failed exchange only costs
    /// the calls that need one.
    pub async fn establish_session(&mut self) {
        let url = format!("{}/login/", self.base_url);
        let form = [
            (
                "csrf_token",
                self.csrf_token.clone().unwrap_or_default(),
            ),
            ("username", self.username.clone()),
            ("password", self.password.clone()),
        ];
        let mut rb = self.http.post(&url).form(&form);
        if let Some(cookie) = self.cookie_header() {
            rb = rb.header(reqwest::header::COOKIE, cookie);
        }
        match rb.send().await {
            Ok(resp) => {
                let cookies = response_cookies(&resp);
                if !cookies.is_empty() {
                    self.cookies = cookies;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "form login failed, continuing without session cookie");
            }
        }
    }

    /// GET `/api/v1/me` to verify the authenticated session.
    pub async fn current_user(&self) -> Result<Value, ClientError> {
        let url = format!("{}/api/v1/me", self.base_url);
        let resp = self
            .authed_get(&url)
            .send()
            .await
            .map_err(|source| ClientError::Http {
                context: "me",
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                context: "me",
                status,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp.json().await.map_err(|source| ClientError::Http {
            context: "me",
            source,
        })?;
        body.get("result")
            .cloned()
            .ok_or_else(|| ClientError::MissingField {
                context: "me",
                field: "result",
                body: body.to_string(),
            })
    }

    /// List up to one page (1000 records) of entities of the given kind.
    /// The order the server returns is preserved.
    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>, ClientError> {
        let url = format!("{}{}", self.base_url, kind.list_path());
        let resp = self
            .authed_get(&url)
            .query(&[("q", listing_expr(kind))])
            .send()
            .await
            .map_err(|source| ClientError::Http {
                context: "listing",
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                context: "listing",
                status,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let body: Value = resp.json().await.map_err(|source| ClientError::Http {
            context: "listing",
            source,
        })?;
        let result = body
            .get("result")
            .and_then(Value::as_array)
            .ok_or_else(|| ClientError::MissingField {
                context: "listing",
                field: "result",
                body: body.to_string(),
            })?;
        if result.is_empty() {
            return Err(ClientError::EmptyResult { context: "listing" });
        }
        let mut entities = Vec::with_capacity(result.len());
        for record in result {
            let name = record
                .get(kind.identity_field())
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::MissingField {
                    context: "listing",
                    field: kind.identity_field(),
                    body: record.to_string(),
                })?;
            let id = record.get("id").and_then(Value::as_u64).unwrap_or_default();
            entities.push(Entity {
                name: name.to_string(),
                id,
            });
        }
        Ok(entities)
    }

    /// Issue one amplified lookup.  Status and body interpretation belong to
    /// the correlator; only transport-level wiring lives here.
    pub async fn lookup(&self, query: &Query) -> Result<reqwest::Response, reqwest::Error> {
        self.authed_get(&query.url)
            .query(&[("q", query.q.as_str())])
            .send()
            .await
    }

    fn authed_get(&self, url: &str) -> reqwest::RequestBuilder {
        let mut rb = self
            .http
            .get(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(token) = &self.access_token {
            rb = rb.bearer_auth(token);
        }
        if let Some(token) = &self.csrf_token {
            rb = rb.header("X-CSRFToken", token.as_str());
        }
        if let Some(cookie) = self.cookie_header() {
            rb = rb.header(reqwest::header::COOKIE, cookie);
        }
        rb
    }

    fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}

/// Collect `name=value` pairs from every `Set-Cookie` header on a response.
/// Attributes after the first `;` are dropped; the harness replays cookies
/// verbatim and never needs expiry or path handling.
fn response_cookies(resp: &reqwest::Response) -> Vec<(String, String)> {
    resp.headers()
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|raw| raw.to_str().ok())
        .filter_map(|raw| {
            let pair = raw.split(';').next()?;
            let (name, value) = pair.split_once('=')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}
