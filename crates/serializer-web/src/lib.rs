//! Axum front end: the story list, change history, health and on-demand scrapes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use serializer_core::links::UrlTransformer;
use serializer_core::Story;
use serializer_storage::{StoreError, StoryStore};
use serializer_sync::ScrapeScheduler;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "serializer-web";

/// Page size of the story list when the caller does not ask for one.
pub const DEFAULT_LIMIT: i64 = 200;
pub const MAX_LIMIT: i64 = 1000;
/// Already-read stories kept above the unread ones on the front page.
const READ_CONTEXT: i64 = 9;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StoryStore>,
    pub scheduler: ScrapeScheduler,
    pub transformers: Arc<Vec<Box<dyn UrlTransformer>>>,
}

impl AppState {
    pub fn new(store: Arc<dyn StoryStore>, scheduler: ScrapeScheduler) -> Self {
        Self {
            store,
            scheduler,
            transformers: Arc::new(Vec::new()),
        }
    }

    pub fn with_transformers(mut self, transformers: Vec<Box<dyn UrlTransformer>>) -> Self {
        self.transformers = Arc::new(transformers);
        self
    }
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("story {id} not found")),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            ApiError::Internal(err) => {
                error!(error = %err, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

/// A stored story plus the display links derived from it.
#[derive(Debug, Serialize)]
struct StoryView {
    #[serde(flatten)]
    story: Story,
    domain: String,
    link_url: String,
    comments_url: String,
    search_url: String,
}

impl StoryView {
    fn new(story: Story, transformers: &[Box<dyn UrlTransformer>]) -> Self {
        Self {
            domain: story.domain(),
            link_url: story.link_url(transformers),
            comments_url: story.comments_url(),
            search_url: story.search_url(),
            story,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    #[serde(default)]
    after: i64,
    limit: Option<i64>,
}

impl ListQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Template)]
#[template(
    ext = "html",
    source = r#"<!doctype html>
<html lang="en">
<head><meta charset="utf-8"><title>serializer ({{ unread }})</title></head>
<body>
<h1>serializer</h1>
<p>{{ unread }} unread</p>
<ol>
{% for s in stories %}
  <li id="story-{{ s.id }}" class="{% if s.unread %}unread{% else %}read{% endif %}">
    <a href="{{ s.link_url }}">{{ s.title }}</a>
    {% if !s.domain.is_empty() %}<small>({{ s.domain }})</small>{% endif %}
    <span>{{ s.score }} points</span>
    <a href="{{ s.comments_url }}">{{ s.num_comments }} comments</a>
    <a href="{{ s.search_url }}">search</a>
  </li>
{% endfor %}
</ol>
</body>
</html>
"#
)]
struct IndexTemplate {
    stories: Vec<IndexRow>,
    unread: usize,
}

struct IndexRow {
    id: i64,
    title: String,
    domain: String,
    link_url: String,
    comments_url: String,
    search_url: String,
    score: i64,
    num_comments: i64,
    unread: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/healthz", get(healthz_handler))
        .route("/scrape", get(scrape_handler))
        .route("/stories", get(stories_handler))
        .route("/stories/{id}/changes", get(changes_handler))
        .with_state(state)
}

/// Serves until `shutdown` resolves, then drains open connections.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn index_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    let last = query.after.max(0);
    let stories = state
        .store
        .list_stories((last - READ_CONTEXT).max(0), query.limit())
        .await?;
    let rows: Vec<IndexRow> = stories
        .into_iter()
        .filter(|s| !s.deleted)
        .map(|s| IndexRow {
            id: s.id,
            domain: s.domain(),
            link_url: s.link_url(&state.transformers),
            comments_url: s.comments_url(),
            search_url: s.search_url(),
            title: s.title,
            score: s.score,
            num_comments: s.num_comments,
            unread: s.id > last,
        })
        .collect();
    let unread = rows.iter().filter(|r| r.unread).count();

    let html = IndexTemplate {
        stories: rows,
        unread,
    }
    .render()
    .map_err(|err| ApiError::Internal(err.into()))?;
    Ok(Html(html).into_response())
}

async fn healthz_handler(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "UP",
        "scheduler": state.scheduler.state(),
        "last_run": state.scheduler.last_run().await,
    }))
    .into_response()
}

async fn scrape_handler(State(state): State<AppState>) -> Response {
    match state.scheduler.trigger().await {
        Ok(result) => {
            info!(created = result.created, updated = result.updated, "scrape success");
            (StatusCode::OK, Json(result)).into_response()
        }
        Err(err) => {
            error!(error = %err, "scrape failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string(), "result": err.result })),
            )
                .into_response()
        }
    }
}

async fn stories_handler(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<StoryView>>, ApiError> {
    let stories = state.store.list_stories(query.after, query.limit()).await?;
    Ok(Json(
        stories
            .into_iter()
            .map(|s| StoryView::new(s, &state.transformers))
            .collect(),
    ))
}

async fn changes_handler(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    if state.store.get_story(id).await?.is_none() {
        return Err(StoreError::NotFound(id).into());
    }
    let changes = state.store.list_changes(id).await?;
    Ok(Json(changes).into_response())
}
