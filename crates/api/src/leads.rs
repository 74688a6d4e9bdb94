//! Lead acquisition
//!
//! Contacts come from the provider's people-search API. Every contact handed
//! to a user costs one lead credit, charged through the ledger before the
//! contacts are stored.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use shipmail_billing::CreditLedger;
use shipmail_shared::{CreditAmounts, CreditType};
use sqlx::{FromRow, PgConnection, PgPool};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

pub const DEFAULT_LEADS_API_BASE: &str = "https://api.apollo.io";
const SEARCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_LEADS_PER_REQUEST: i64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

impl Contact {
    /// Lower-cased email with surrounding whitespace removed
    pub fn normalized(mut self) -> Option<Self> {
        let email = self.email.trim().to_ascii_lowercase();
        let (local, domain) = email.split_once('@')?;
        if local.is_empty() || !domain.contains('.') {
            return None;
        }
        self.email = email;
        Some(self)
    }
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    people: Vec<ProviderPerson>,
}

#[derive(Deserialize)]
struct ProviderPerson {
    email: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    title: Option<String>,
    organization: Option<ProviderOrganization>,
    sanitized_phone: Option<String>,
}

#[derive(Deserialize)]
struct ProviderOrganization {
    name: Option<String>,
}

impl ProviderPerson {
    fn into_contact(self) -> Option<Contact> {
        Contact {
            email: self.email?,
            first_name: self.first_name,
            last_name: self.last_name,
            company: self.organization.and_then(|o| o.name),
            title: self.title,
            phone: self.sanitized_phone,
        }
        .normalized()
    }
}

enum SearchFailure {
    Transient(String),
    Permanent(ApiError),
}

/// Client for the contact search provider
pub struct LeadSearchClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl LeadSearchClient {
    pub fn new(api_key: String, api_base: String) -> ApiResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(SEARCH_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    /// Search people matching `query`; returns at most `limit` contacts
    /// with an email address
    pub async fn search(&self, query: &str, limit: i64) -> ApiResult<Vec<Contact>> {
        let limit = limit.clamp(1, MAX_LEADS_PER_REQUEST);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        let result = RetryIf::spawn(
            strategy,
            || self.search_once(query, limit),
            |e: &SearchFailure| matches!(e, SearchFailure::Transient(_)),
        )
        .await;

        match result {
            Ok(mut contacts) => {
                contacts.truncate(limit as usize);
                Ok(contacts)
            }
            Err(SearchFailure::Transient(msg)) => Err(ApiError::Upstream(msg)),
            Err(SearchFailure::Permanent(e)) => Err(e),
        }
    }

    async fn search_once(&self, query: &str, limit: i64) -> Result<Vec<Contact>, SearchFailure> {
        let response = self
            .http
            .post(format!("{}/api/v1/mixed_people/search", self.api_base))
            .header("x-api-key", &self.api_key)
            .json(&json!({ "q_keywords": query, "page": 1, "per_page": limit }))
            .send()
            .await
            .map_err(|e| SearchFailure::Transient(format!("lead search: {}", e)))?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(SearchFailure::Transient(format!(
                "lead search returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Lead search rejected");
            return Err(SearchFailure::Permanent(ApiError::Upstream(format!(
                "lead search returned {}",
                status
            ))));
        }

        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| SearchFailure::Permanent(ApiError::Upstream(e.to_string())))?;

        Ok(body
            .people
            .into_iter()
            .filter_map(ProviderPerson::into_contact)
            .collect())
    }
}

/// Insert contacts the user doesn't already have; returns the new ones
pub async fn store_leads(
    conn: &mut PgConnection,
    user_id: &str,
    contacts: &[Contact],
    source: &str,
) -> ApiResult<Vec<Contact>> {
    let mut created = Vec::new();
    for contact in contacts {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO leads (id, user_id, email, first_name, last_name, company, title, phone, source)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (user_id, email) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(&contact.email)
        .bind(&contact.first_name)
        .bind(&contact.last_name)
        .bind(&contact.company)
        .bind(&contact.title)
        .bind(&contact.phone)
        .bind(source)
        .fetch_optional(&mut *conn)
        .await?;

        if inserted.is_some() {
            created.push(contact.clone());
        }
    }
    Ok(created)
}

/// How many contacts a search may return given the caller's lead credits
pub fn search_cap(requested: i64, available: i64) -> i64 {
    requested.clamp(0, MAX_LEADS_PER_REQUEST).min(available.max(0))
}

/// Search for a user, charge one lead credit per returned contact and keep
/// the contacts
pub async fn search_for_user(
    pool: &PgPool,
    ledger: &CreditLedger,
    client: &LeadSearchClient,
    user_id: &str,
    query: &str,
    limit: i64,
    source: &str,
) -> ApiResult<Vec<Contact>> {
    let available = ledger.get_available(user_id, CreditType::Leads).await?;
    let cap = search_cap(limit, available);
    if cap == 0 {
        return Err(ApiError::InsufficientCredits(format!(
            "Insufficient leads credits: requested {}, available {}",
            limit.max(1),
            available
        )));
    }

    let contacts = client.search(query, cap).await?;
    if contacts.is_empty() {
        return Ok(contacts);
    }

    ledger
        .consume(
            user_id,
            &CreditAmounts::single(CreditType::Leads, contacts.len() as i64),
            json!({ "source": source, "query": query }),
        )
        .await?;

    // Contacts are paid for; a storage failure must not withhold them
    let mut conn = pool.acquire().await?;
    if let Err(e) = store_leads(&mut conn, user_id, &contacts, source).await {
        tracing::error!(user_id = %user_id, error = %e, "Failed to store searched leads");
    }

    Ok(contacts)
}

/// Store caller-supplied contacts; only newly created ones are charged
pub async fn create_for_user(
    pool: &PgPool,
    ledger: &CreditLedger,
    user_id: &str,
    contacts: Vec<Contact>,
) -> ApiResult<Vec<Contact>> {
    let contacts: Vec<Contact> = contacts.into_iter().filter_map(Contact::normalized).collect();
    if contacts.is_empty() {
        return Err(ApiError::Validation("No valid contacts supplied".to_string()));
    }

    let mut tx = pool.begin().await?;
    let created = store_leads(&mut tx, user_id, &contacts, "api").await?;
    if !created.is_empty() {
        // Same transaction as the inserts: short credits undo them
        ledger
            .consume_in(
                &mut tx,
                user_id,
                &CreditAmounts::single(CreditType::Leads, created.len() as i64),
                json!({ "source": "api_create" }),
            )
            .await?;
    }
    tx.commit().await?;

    Ok(created)
}

#[derive(Debug, Clone, FromRow)]
struct LeadSearchRow {
    user_id: String,
    query: String,
    daily_limit: i64,
}

/// Result of one daily fetch run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyFetchSummary {
    pub searched: usize,
    pub skipped: usize,
    pub failed: usize,
    pub leads_added: usize,
}

/// Run every enabled saved search, capped by the owner's lead credits
pub async fn run_daily_fetch(
    pool: &PgPool,
    ledger: &CreditLedger,
    client: &LeadSearchClient,
) -> ApiResult<DailyFetchSummary> {
    let searches: Vec<LeadSearchRow> = sqlx::query_as(
        r#"
        SELECT user_id, query, daily_limit
        FROM lead_searches
        WHERE enabled
          AND (last_run_at IS NULL OR last_run_at < NOW() - INTERVAL '20 hours')
        ORDER BY last_run_at NULLS FIRST
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut summary = DailyFetchSummary::default();
    for search in searches {
        let available = match ledger.get_available(&search.user_id, CreditType::Leads).await {
            Ok(available) => available,
            Err(e) => {
                summary.failed += 1;
                tracing::error!(user_id = %search.user_id, error = %e, "Failed to read lead credits");
                continue;
            }
        };
        if search_cap(search.daily_limit, available) == 0 {
            summary.skipped += 1;
            continue;
        }

        match search_for_user(
            pool,
            ledger,
            client,
            &search.user_id,
            &search.query,
            search.daily_limit,
            "daily_fetch",
        )
        .await
        {
            Ok(contacts) => {
                summary.searched += 1;
                summary.leads_added += contacts.len();
                sqlx::query("UPDATE lead_searches SET last_run_at = NOW() WHERE user_id = $1")
                    .bind(&search.user_id)
                    .execute(pool)
                    .await?;
            }
            Err(e) => {
                summary.failed += 1;
                tracing::error!(user_id = %search.user_id, error = %e, "Daily lead fetch failed");
            }
        }
    }

    tracing::info!(
        searched = summary.searched,
        skipped = summary.skipped,
        failed = summary.failed,
        leads_added = summary.leads_added,
        "Daily lead fetch complete"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(server: &mockito::Server) -> LeadSearchClient {
        LeadSearchClient::new("leads-key".to_string(), server.url()).unwrap()
    }

    #[test]
    fn test_search_cap() {
        assert_eq!(search_cap(25, 500), 25);
        assert_eq!(search_cap(25, 10), 10);
        assert_eq!(search_cap(500, 1000), MAX_LEADS_PER_REQUEST);
        assert_eq!(search_cap(25, 0), 0);
        assert_eq!(search_cap(-3, 100), 0);
    }

    #[test]
    fn test_contact_normalization() {
        let contact = Contact {
            email: "  Jane@Store.Example ".to_string(),
            first_name: Some("Jane".to_string()),
            last_name: None,
            company: None,
            title: None,
            phone: None,
        };
        assert_eq!(contact.normalized().unwrap().email, "jane@store.example");

        let bad = Contact {
            email: "no-at-sign".to_string(),
            first_name: None,
            last_name: None,
            company: None,
            title: None,
            phone: None,
        };
        assert!(bad.normalized().is_none());
    }

    #[tokio::test]
    async fn test_search_maps_people_and_skips_missing_emails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/mixed_people/search")
            .match_header("x-api-key", "leads-key")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"q_keywords":"shopify store owner","per_page":2}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"people":[
                    {"email":"ana@shop.example","first_name":"Ana","last_name":"Diaz",
                     "title":"Founder","organization":{"name":"Shop Co"},"sanitized_phone":"+15550100"},
                    {"email":null,"first_name":"Hidden"}
                ]}"#,
            )
            .create_async()
            .await;

        let contacts = client(&server).search("shopify store owner", 2).await.unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].company.as_deref(), Some("Shop Co"));
        assert_eq!(contacts[0].phone.as_deref(), Some("+15550100"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("POST", "/api/v1/mixed_people/search")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let err = client(&server).search("dropshipping", 5).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
        failing.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let rejected = server
            .mock("POST", "/api/v1/mixed_people/search")
            .with_status(401)
            .expect(1)
            .create_async()
            .await;

        let err = client(&server).search("dropshipping", 5).await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream(_)));
        rejected.assert_async().await;
    }
}
