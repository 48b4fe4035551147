use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::realtime;
use super::traits::Backend;
use super::types::{
    ChangeEvent, ConversationLookup, ProfileQuery, RequestQuery, Subscription, CONVERSATIONS, MESSAGES, PROFILES,
    REQUESTS, REVIEWS,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{
    Conversation, Message, NewConversation, NewMessage, NewReview, NewServiceRequest, Profile, ProfileUpdate,
    RequestStatus, ServiceRequest,
};
use crate::services::rating::aggregate;

const REQUEST_SELECT: &str = "*,profiles:profiles!requester_id(*)";
const CONVERSATION_SELECT: &str =
    "*,donor_profile:profiles!donor_id(*),requester_profile:profiles!requester_id(*)";
const RATING_FUNCTION: &str = "rate_profile";
const FUNCTION_NOT_FOUND: &str = "PGRST202";

type Params = Vec<(&'static str, String)>;

/// Backend talking to the hosted platform over its REST, storage and realtime APIs
pub struct RestBackend {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
    realtime_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    code: Option<String>,
    message: Option<String>,
    error: Option<String>,
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// Double-quote a value inside a logical `or=(…)` filter so `,` `(` `)` and `"` stay literal
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

impl RestBackend {
    pub fn new(config: &Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.http_timeout())
            .user_agent(concat!("khadamati/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: config.supabase_url.trim_end_matches('/').to_string(),
            anon_key: config.anon_key.clone(),
            access_token: config.access_token.clone(),
            realtime_url: config.realtime_url(),
        })
    }

    fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .bearer_auth(self.bearer())
    }

    fn table(&self, method: Method, table: &str) -> RequestBuilder {
        self.request(method, &format!("rest/v1/{}", table))
    }

    /// Send a request, turning non-2xx responses into typed errors
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(parsed) => (parsed.code, parsed.message.or(parsed.error).unwrap_or_else(|| body.clone())),
            Err(_) => (None, body),
        };
        warn!("Backend returned {}: {}", status, message);
        Err(Error::api(status.as_u16(), code, message))
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, params: Params) -> Result<Vec<T>> {
        debug!("GET {} {:?}", table, params);
        let response = self.send(self.table(Method::GET, table).query(&params)).await?;
        Ok(response.json().await?)
    }

    async fn select_one<T: DeserializeOwned>(&self, table: &str, mut params: Params) -> Result<Option<T>> {
        params.push(("limit", "1".to_string()));
        let rows: Vec<T> = self.select(table, params).await?;
        Ok(rows.into_iter().next())
    }

    async fn insert<B: Serialize + ?Sized, T: DeserializeOwned>(&self, table: &str, body: &B, select: &str) -> Result<T> {
        let request = self
            .table(Method::POST, table)
            .query(&[("select", select)])
            .header("Prefer", "return=representation")
            .json(body);
        let rows: Vec<T> = self.send(request).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("{} insert returned no row", table)))
    }

    async fn update<B: Serialize + ?Sized>(&self, table: &str, params: Params, body: &B) -> Result<()> {
        let request = self.table(Method::PATCH, table).query(&params).json(body);
        self.send(request).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, params: Params) -> Result<()> {
        debug!("DELETE {} {:?}", table, params);
        self.send(self.table(Method::DELETE, table).query(&params)).await?;
        Ok(())
    }

    async fn count(&self, table: &str, params: Params) -> Result<u64> {
        let request = self
            .table(Method::HEAD, table)
            .query(&params)
            .header("Prefer", "count=exact");
        let response = self.send(request).await?;
        let range = response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        parse_content_range(range).ok_or_else(|| Error::api(500, None, format!("unexpected content-range '{}'", range)))
    }

    /// Read-then-write rating update for projects without the server-side function
    async fn apply_rating_unguarded(&self, profile_id: &str, stars: u8) -> Result<Profile> {
        let current = self
            .get_profile(profile_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))?;
        let (rating, reviews_count) = aggregate(current.rating, current.reviews_count, stars);

        let request = self
            .table(Method::PATCH, PROFILES)
            .query(&[("id", eq(profile_id))])
            .header("Prefer", "return=representation")
            .json(&json!({ "rating": rating, "reviews_count": reviews_count }));
        let rows: Vec<Profile> = self.send(request).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("profile {}", profile_id)))
    }
}

/// Total from a `Content-Range` header such as `0-24/310` or `*/0`
fn parse_content_range(range: &str) -> Option<u64> {
    range.rsplit_once('/').and_then(|(_, total)| total.trim().parse().ok())
}

#[async_trait]
impl Backend for RestBackend {
    async fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        self.select_one(PROFILES, vec![("select", "*".to_string()), ("id", eq(id))]).await
    }

    async fn search_profiles(&self, query: &ProfileQuery) -> Result<Vec<Profile>> {
        let mut params: Params = vec![("select", "*".to_string()), ("limit", query.limit.to_string())];
        match query.search.as_deref() {
            Some(term) if !term.is_empty() => {
                let pattern = quoted(&format!("*{}*", term));
                params.push(("or", format!("(full_name.ilike.{pattern},username.ilike.{pattern})")));
            }
            _ => params.push(("order", "rating.desc".to_string())),
        }
        if query.providers_only {
            params.push(("role", "in.(technician,requester)".to_string()));
        }
        self.select(PROFILES, params).await
    }

    async fn find_profile_conflict(
        &self,
        exclude_id: &str,
        username: &str,
        full_name: &str,
    ) -> Result<Option<Profile>> {
        let params = vec![
            ("select", "*".to_string()),
            ("or", format!("(username.eq.{},full_name.eq.{})", quoted(username), quoted(full_name))),
            ("id", format!("neq.{}", exclude_id)),
        ];
        self.select_one(PROFILES, params).await
    }

    async fn upsert_profile(&self, update: &ProfileUpdate) -> Result<Profile> {
        let request = self
            .table(Method::POST, PROFILES)
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(update);
        let rows: Vec<Profile> = self.send(request).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("profile {}", update.id)))
    }

    async fn set_avatar_url(&self, profile_id: &str, url: &str) -> Result<()> {
        self.update(PROFILES, vec![("id", eq(profile_id))], &json!({ "avatar_url": url })).await
    }

    async fn apply_rating(&self, profile_id: &str, stars: u8) -> Result<Profile> {
        let request = self
            .request(Method::POST, &format!("rest/v1/rpc/{}", RATING_FUNCTION))
            .json(&json!({ "target_id": profile_id, "stars": stars }));

        match self.send(request).await {
            Ok(response) => Ok(response.json().await?),
            Err(err) if err.code() == Some(FUNCTION_NOT_FOUND) || err.is_not_found() => {
                warn!(
                    "Function {} unavailable ({}); updating rating without a transaction",
                    RATING_FUNCTION, err
                );
                self.apply_rating_unguarded(profile_id, stars).await
            }
            Err(err) => Err(err),
        }
    }

    async fn has_review(&self, profile_id: &str, user_id: &str) -> Result<bool> {
        let params = vec![
            ("select", "id".to_string()),
            ("profile_id", eq(profile_id)),
            ("user_id", eq(user_id)),
        ];
        let row: Option<serde_json::Value> = self.select_one(REVIEWS, params).await?;
        Ok(row.is_some())
    }

    async fn insert_review(&self, review: &NewReview) -> Result<()> {
        self.send(self.table(Method::POST, REVIEWS).json(review)).await?;
        Ok(())
    }

    async fn count_profiles(&self) -> Result<u64> {
        self.count(PROFILES, vec![("select", "*".to_string())]).await
    }

    async fn list_requests(&self, query: &RequestQuery) -> Result<Vec<ServiceRequest>> {
        let mut params: Params = vec![("select", REQUEST_SELECT.to_string())];
        if let Some(status) = query.status {
            params.push(("status", eq(status.as_str())));
        }
        if let Some(owner) = &query.requester_id {
            params.push(("requester_id", eq(owner)));
        }
        if let Some(after) = query.created_after {
            params.push(("created_at", format!("gt.{}", timestamp(after))));
        }
        self.select(REQUESTS, params).await
    }

    async fn get_request(&self, id: &str) -> Result<Option<ServiceRequest>> {
        self.select_one(REQUESTS, vec![("select", REQUEST_SELECT.to_string()), ("id", eq(id))]).await
    }

    async fn insert_request(&self, request: &NewServiceRequest) -> Result<ServiceRequest> {
        let created: ServiceRequest = self.insert(REQUESTS, request, REQUEST_SELECT).await?;
        info!("Created listing {}", created.id);
        Ok(created)
    }

    async fn delete_request(&self, id: &str) -> Result<()> {
        self.delete(REQUESTS, vec![("id", eq(id))]).await
    }

    async fn count_requests(&self, status: Option<RequestStatus>) -> Result<u64> {
        let mut params: Params = vec![("select", "*".to_string())];
        if let Some(status) = status {
            params.push(("status", eq(status.as_str())));
        }
        self.count(REQUESTS, params).await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        let params = vec![
            ("select", CONVERSATION_SELECT.to_string()),
            ("or", format!("(donor_id.eq.{user_id},requester_id.eq.{user_id})")),
            ("order", "last_message_at.desc".to_string()),
        ];
        self.select(CONVERSATIONS, params).await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.select_one(CONVERSATIONS, vec![("select", CONVERSATION_SELECT.to_string()), ("id", eq(id))])
            .await
    }

    async fn find_conversation(&self, lookup: &ConversationLookup) -> Result<Option<Conversation>> {
        let mut params: Params = vec![("select", "*".to_string())];
        match lookup {
            ConversationLookup::ForRequest { request_id, donor_id } => {
                params.push(("request_id", eq(request_id)));
                params.push(("donor_id", eq(donor_id)));
            }
            ConversationLookup::BetweenUsers { first, second } => {
                params.push((
                    "or",
                    format!(
                        "(and(donor_id.eq.{first},requester_id.eq.{second}),and(donor_id.eq.{second},requester_id.eq.{first}))"
                    ),
                ));
            }
        }
        self.select_one(CONVERSATIONS, params).await
    }

    async fn insert_conversation(&self, conversation: &NewConversation) -> Result<Conversation> {
        self.insert(CONVERSATIONS, conversation, "*").await
    }

    async fn touch_conversation(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.update(CONVERSATIONS, vec![("id", eq(id))], &json!({ "last_message_at": timestamp(at) }))
            .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.delete(CONVERSATIONS, vec![("id", eq(id))]).await
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let params = vec![
            ("select", "*".to_string()),
            ("conversation_id", eq(conversation_id)),
            ("order", "created_at.asc".to_string()),
        ];
        self.select(MESSAGES, params).await
    }

    async fn insert_message(&self, message: &NewMessage) -> Result<Message> {
        self.insert(MESSAGES, message, "*").await
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        self.delete(MESSAGES, vec![("id", eq(id))]).await
    }

    async fn delete_messages_in(&self, conversation_id: &str) -> Result<()> {
        self.delete(MESSAGES, vec![("conversation_id", eq(conversation_id))]).await
    }

    async fn upload_object(&self, bucket: &str, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        debug!("Uploading {} bytes to {}/{}", bytes.len(), bucket, path);
        let request = self
            .request(Method::POST, &format!("storage/v1/object/{}/{}", bucket, path))
            .header(CONTENT_TYPE, content_type)
            .body(bytes);
        self.send(request).await?;
        Ok(())
    }

    fn public_url(&self, bucket: &str, path: &str) -> String {
        format!("{}/storage/v1/object/public/{}/{}", self.base_url, bucket, path)
    }

    async fn subscribe(&self, subscription: &Subscription) -> Result<mpsc::Receiver<ChangeEvent>> {
        realtime::subscribe(&self.realtime_url, self.bearer(), subscription).await
    }
}
