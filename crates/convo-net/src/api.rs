//! Request/response calls against the chat server's HTTP API.

use std::future::Future;

use convo_core::{
    LoginReply, Message, PageQuery, RegisterReply, RosterEntry, SyncError, SyncErrorCategory,
    UnreadCounts, classify_http_status,
};
use reqwest::{Client, Response, StatusCode};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, trace};
use url::Url;

/// HTTP API consumed by the runtime.
pub trait ChatApi: Send + Sync + 'static {
    fn register(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<RegisterReply, SyncError>> + Send;

    fn login(
        &self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Result<LoginReply, SyncError>> + Send;

    /// Roster of every other account with its presence.
    fn users(
        &self,
        current_user: &str,
    ) -> impl Future<Output = Result<Vec<RosterEntry>, SyncError>> + Send;

    /// One history page, in whichever order the server keeps it. `None`
    /// lets the server pick its default page.
    fn conversation(
        &self,
        current_user: &str,
        selected_user: &str,
        page: Option<PageQuery>,
    ) -> impl Future<Output = Result<Vec<Message>, SyncError>> + Send;

    fn unread_counts(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<UnreadCounts, SyncError>> + Send;

    /// Mark every message from `from_user` to `current_user` as read.
    fn mark_as_read(
        &self,
        current_user: &str,
        from_user: &str,
    ) -> impl Future<Output = Result<(), SyncError>> + Send;
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkAsReadBody<'a> {
    current_user: &'a str,
    from_user: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base: Url,
}

impl HttpChatApi {
    pub fn new(base: Url) -> Result<Self, SyncError> {
        let client = Client::builder().build().map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Config,
                "http_client_build_error",
                err.to_string(),
            )
        })?;
        Ok(Self::with_client(client, base))
    }

    pub fn with_client(client: Client, base: Url) -> Self {
        Self {
            client,
            base: directory_base(base),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    async fn post_json<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, SyncError> {
        let url = endpoint(&self.base, path)?;
        trace!(%url, "POST");
        self.client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(map_transport_error)
    }

    async fn get(&self, url: Url) -> Result<Response, SyncError> {
        trace!(%url, "GET");
        self.client
            .get(url)
            .send()
            .await
            .map_err(map_transport_error)
    }
}

impl ChatApi for HttpChatApi {
    async fn register(&self, username: &str, password: &str) -> Result<RegisterReply, SyncError> {
        let response = self
            .post_json("register", &Credentials { username, password })
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let message = read_text(response).await?;
            debug!(%username, "registration rejected: username taken");
            return Ok(RegisterReply {
                success: false,
                message,
            });
        }
        decode_json(ensure_success("register", response).await?).await
    }

    async fn login(&self, username: &str, password: &str) -> Result<LoginReply, SyncError> {
        let response = self
            .post_json("login", &Credentials { username, password })
            .await?;

        // Bad credentials come back as plain text.
        if matches!(
            response.status(),
            StatusCode::UNAUTHORIZED | StatusCode::BAD_REQUEST
        ) {
            let message = read_text(response).await?;
            return Ok(LoginReply {
                success: false,
                message,
            });
        }
        decode_json(ensure_success("login", response).await?).await
    }

    async fn users(&self, current_user: &str) -> Result<Vec<RosterEntry>, SyncError> {
        let url = users_url(&self.base, current_user)?;
        let response = ensure_success("users", self.get(url).await?).await?;
        let entries: Option<Vec<RosterEntry>> = decode_json(response).await?;
        Ok(entries.unwrap_or_default())
    }

    async fn conversation(
        &self,
        current_user: &str,
        selected_user: &str,
        page: Option<PageQuery>,
    ) -> Result<Vec<Message>, SyncError> {
        let url = conversation_url(&self.base, current_user, selected_user, page)?;
        let response = ensure_success("conversation", self.get(url).await?).await?;
        let messages: Option<Vec<Message>> = decode_json(response).await?;
        Ok(messages.unwrap_or_default())
    }

    async fn unread_counts(&self, username: &str) -> Result<UnreadCounts, SyncError> {
        let url = unread_counts_url(&self.base, username)?;
        let response = ensure_success("unreadCounts", self.get(url).await?).await?;
        let counts: Option<UnreadCounts> = decode_json(response).await?;
        Ok(counts.unwrap_or_default())
    }

    async fn mark_as_read(&self, current_user: &str, from_user: &str) -> Result<(), SyncError> {
        let response = self
            .post_json(
                "markAsRead",
                &MarkAsReadBody {
                    current_user,
                    from_user,
                },
            )
            .await?;
        ensure_success("markAsRead", response).await?;
        Ok(())
    }
}

/// Make relative joins land below the base path instead of replacing its
/// last segment.
fn directory_base(mut base: Url) -> Url {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.set_query(None);
    base.set_fragment(None);
    base
}

fn endpoint(base: &Url, path: &str) -> Result<Url, SyncError> {
    base.join(path).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Config,
            "invalid_endpoint",
            format!("cannot build endpoint '{path}' from {base}: {err}"),
        )
    })
}

pub(crate) fn users_url(base: &Url, current_user: &str) -> Result<Url, SyncError> {
    let mut url = endpoint(base, "users")?;
    url.query_pairs_mut()
        .append_pair("currentUser", current_user);
    Ok(url)
}

pub(crate) fn conversation_url(
    base: &Url,
    current_user: &str,
    selected_user: &str,
    page: Option<PageQuery>,
) -> Result<Url, SyncError> {
    let mut url = endpoint(base, "conversation")?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("currentUser", current_user)
            .append_pair("selectedUser", selected_user);
        if let Some(page) = page {
            query
                .append_pair("limit", &page.limit.to_string())
                .append_pair("offset", &page.offset.to_string());
        }
    }
    Ok(url)
}

pub(crate) fn unread_counts_url(base: &Url, username: &str) -> Result<Url, SyncError> {
    let mut url = endpoint(base, "unreadCounts")?;
    url.query_pairs_mut().append_pair("username", username);
    Ok(url)
}

async fn ensure_success(operation: &str, response: Response) -> Result<Response, SyncError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(SyncError::new(
        classify_http_status(status.as_u16()),
        "http_status",
        format!("{operation} returned {status}: {}", body.trim()),
    ))
}

async fn read_text(response: Response) -> Result<String, SyncError> {
    response
        .text()
        .await
        .map(|body| body.trim().to_owned())
        .map_err(map_transport_error)
}

async fn decode_json<T: DeserializeOwned>(response: Response) -> Result<T, SyncError> {
    let bytes = response.bytes().await.map_err(map_transport_error)?;
    serde_json::from_slice(&bytes).map_err(|err| {
        SyncError::protocol("invalid_response", format!("unexpected response body: {err}"))
    })
}

fn map_transport_error(err: reqwest::Error) -> SyncError {
    if let Some(status) = err.status() {
        return SyncError::new(
            classify_http_status(status.as_u16()),
            "http_status",
            err.to_string(),
        );
    }
    if err.is_builder() {
        return SyncError::new(SyncErrorCategory::Config, "http_request_invalid", err.to_string());
    }
    if err.is_decode() {
        return SyncError::protocol("invalid_response", err.to_string());
    }
    SyncError::network("http_transport_error", err.to_string())
}
