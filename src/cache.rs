//! Local mirror of a server-owned collection.
//!
//! A [`CollectionCache`] holds the last-fetched page of one resource and applies
//! confirmed mutations to it without a refetch. Nothing is optimistic: the mirror
//! only changes after the server has answered successfully, so a failed call
//! leaves it exactly as it was.
//!
//! Responses can arrive out of order. Every operation takes a ticket when it is
//! issued, and a response is merged only if no later-issued operation on the
//! same id (or, for lists, no later-issued list) has been merged already.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::observable::{Observable, Subscription};
use crate::pipeline::RequestPipeline;
use crate::store::CredentialStore;
use crate::transport::{ApiRequest, Transport};
use crate::types::EntityId;

/// A server-owned entity addressed by a unique id under a collection path.
pub trait Resource: Clone + PartialEq + DeserializeOwned + Send + Sync + 'static {
    /// Collection path, e.g. `/projects`.
    const PATH: &'static str;

    /// Filters accepted by the collection's list endpoint.
    type Filters: ListQuery + Send + Sync;

    fn id(&self) -> &EntityId;
}

/// Filters that encode themselves as query parameters.
pub trait ListQuery {
    fn apply(&self, request: ApiRequest) -> ApiRequest;
}

impl ListQuery for () {
    fn apply(&self, request: ApiRequest) -> ApiRequest {
        request
    }
}

/// One page of a collection as currently mirrored.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<R> {
    pub items: Vec<R>,
    /// Total across all pages, as reported by the server.
    pub total: u64,
}

impl<R> Default for Listing<R> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
        }
    }
}

/// List endpoints answer with a page envelope; sub-resource queries with a
/// bare array.
#[derive(Deserialize)]
#[serde(untagged)]
enum PageBody<R> {
    #[serde(rename_all = "camelCase")]
    Paged {
        content: Vec<R>,
        #[serde(default)]
        total_elements: Option<u64>,
    },
    Plain(Vec<R>),
}

impl<R> From<PageBody<R>> for Listing<R> {
    fn from(body: PageBody<R>) -> Self {
        match body {
            PageBody::Paged {
                content,
                total_elements,
            } => {
                let total = total_elements.unwrap_or(content.len() as u64);
                Self {
                    items: content,
                    total,
                }
            }
            PageBody::Plain(items) => Self {
                total: items.len() as u64,
                items,
            },
        }
    }
}

#[derive(Default)]
struct Tickets {
    next: u64,
    list_merged: u64,
    merged: HashMap<EntityId, u64>,
    /// Responses to operations issued before the last `clear` are dropped.
    floor: u64,
}

/// Non-optimistic mirror of one resource collection.
pub struct CollectionCache<R, T, S> {
    pipeline: RequestPipeline<T, S>,
    state: Observable<Listing<R>>,
    tickets: Mutex<Tickets>,
    page_size: u32,
}

impl<R, T, S> CollectionCache<R, T, S>
where
    R: Resource,
    T: Transport,
    S: CredentialStore,
{
    #[must_use]
    pub fn new(pipeline: RequestPipeline<T, S>) -> Self {
        let page_size = pipeline.session().config().default_page_size();
        Self {
            pipeline,
            state: Observable::default(),
            tickets: Mutex::new(Tickets::default()),
            page_size,
        }
    }

    /// Snapshot of the mirrored page.
    #[must_use]
    pub fn snapshot(&self) -> Listing<R> {
        self.state.get()
    }

    #[must_use]
    pub fn items(&self) -> Vec<R> {
        self.state.with(|listing| listing.items.clone())
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.state.with(|listing| listing.total)
    }

    /// Cached entry with `id`, if it is on the mirrored page.
    #[must_use]
    pub fn cached(&self, id: &EntityId) -> Option<R> {
        self.state
            .with(|listing| listing.items.iter().find(|item| item.id() == id).cloned())
    }

    #[must_use]
    pub fn state(&self) -> &Observable<Listing<R>> {
        &self.state
    }

    /// Observe every change to the mirrored page.
    pub fn subscribe(&self, callback: impl Fn(&Listing<R>) + Send + Sync + 'static) -> Subscription<Listing<R>> {
        self.state.subscribe(callback)
    }

    /// Drop the mirrored page, e.g. after sign-out.
    ///
    /// Operations still in flight complete for their callers, but their results
    /// are no longer merged.
    pub fn clear(&self) {
        let mut tickets = self.tickets.lock();
        tickets.next += 1;
        tickets.floor = tickets.next;
        tickets.list_merged = tickets.next;
        tickets.merged.clear();
        self.state.set(Listing::default());
    }

    /// Fetch one page and replace the mirror with it.
    ///
    /// `page` is zero-based. The mirror holds only this page afterwards; listing
    /// with different filters is a full replace.
    ///
    /// # Errors
    ///
    /// Pipeline errors are returned as-is and leave the mirror untouched.
    pub async fn list(&self, filters: &R::Filters, page: u32, page_size: u32) -> Result<Listing<R>, Error> {
        let request = filters.apply(
            ApiRequest::get(R::PATH)
                .with_query("page", page.to_string())
                .with_query("size", page_size.to_string()),
        );
        let ticket = self.issue();
        let listing: Listing<R> = self.pipeline.fetch::<PageBody<R>>(&request).await?.into();

        let mut tickets = self.tickets.lock();
        if tickets.list_merged > ticket {
            tracing::debug!(path = R::PATH, "dropping list result superseded by a newer list or a clear");
            return Ok(listing);
        }
        tickets.list_merged = ticket;
        tickets.merged.retain(|_, merged| *merged > ticket);
        self.state.set(listing.clone());
        Ok(listing)
    }

    /// [`list`](Self::list) with the configured default page size.
    ///
    /// # Errors
    ///
    /// As `list`.
    pub async fn list_page(&self, filters: &R::Filters, page: u32) -> Result<Listing<R>, Error> {
        self.list(filters, page, self.page_size).await
    }

    /// Fetch one entity and refresh its cached entry. Never inserts.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn get(&self, id: &EntityId) -> Result<R, Error> {
        self.mutate(ApiRequest::get(entity_path::<R>(id))).await
    }

    /// Create an entity and append the server's copy.
    ///
    /// # Errors
    ///
    /// Pipeline errors; nothing is appended.
    pub async fn create<B: Serialize + ?Sized>(&self, payload: &B) -> Result<R, Error> {
        let request = ApiRequest::post(R::PATH).with_json(payload)?;
        let ticket = self.issue();
        let created: R = self.pipeline.fetch(&request).await?;
        self.merge(ticket, created.clone(), true);
        Ok(created)
    }

    /// Replace an entity. The cached entry is updated in place if present; an
    /// id that is not on the mirrored page is left out.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn update<B: Serialize + ?Sized>(&self, id: &EntityId, payload: &B) -> Result<R, Error> {
        self.mutate(ApiRequest::put(entity_path::<R>(id)).with_json(payload)?)
            .await
    }

    /// Partial update through `PATCH /<resource>/{id}/<subpath>`, merged like
    /// [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn patch<B: Serialize + ?Sized>(&self, id: &EntityId, subpath: &str, payload: &B) -> Result<R, Error> {
        let path = format!("{}/{}", entity_path::<R>(id), subpath.trim_matches('/'));
        self.mutate(ApiRequest::patch(path).with_json(payload)?).await
    }

    /// Delete an entity and drop its cached entry.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the entry stays.
    pub async fn delete(&self, id: &EntityId) -> Result<(), Error> {
        let request = ApiRequest::delete(entity_path::<R>(id));
        let ticket = self.issue();
        self.pipeline.send(&request).await?;

        let mut tickets = self.tickets.lock();
        if tickets.floor > ticket {
            return Ok(());
        }
        // A confirmed delete always wins; later responses for the id are stale.
        let merged = tickets.merged.entry(id.clone()).or_insert(0);
        *merged = (*merged).max(ticket);
        self.state.update(|listing| {
            let before = listing.items.len();
            listing.items.retain(|item| item.id() != id);
            if listing.items.len() < before {
                listing.total = listing.total.saturating_sub(1);
            }
        });
        Ok(())
    }

    /// Add a user to the entity's assignees.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn assign_user(&self, id: &EntityId, user: &EntityId) -> Result<R, Error> {
        let path = format!("{}/assign/{}", entity_path::<R>(id), urlencoding::encode(user.as_str()));
        self.mutate(ApiRequest::post(path).with_json(&serde_json::json!({}))?)
            .await
    }

    /// Remove a user from the entity's assignees.
    ///
    /// # Errors
    ///
    /// Pipeline errors; the mirror is untouched.
    pub async fn remove_user(&self, id: &EntityId, user: &EntityId) -> Result<R, Error> {
        let path = format!("{}/assign/{}", entity_path::<R>(id), urlencoding::encode(user.as_str()));
        self.mutate(ApiRequest::delete(path)).await
    }

    /// Send a call that answers with one entity and merge it in place.
    pub(crate) async fn mutate(&self, request: ApiRequest) -> Result<R, Error> {
        let ticket = self.issue();
        let entity: R = self.pipeline.fetch(&request).await?;
        self.merge(ticket, entity.clone(), false);
        Ok(entity)
    }

    /// Query a related endpoint without touching the mirror.
    pub(crate) async fn query<V: DeserializeOwned>(&self, request: ApiRequest) -> Result<V, Error> {
        self.pipeline.fetch(&request).await
    }

    /// Fetch one page of a related list (`/my-projects`, `/project/{id}`)
    /// without touching the mirror.
    pub(crate) async fn query_page(&self, subpath: &str, page: u32, page_size: u32) -> Result<Listing<R>, Error> {
        let request = ApiRequest::get(format!("{}/{}", R::PATH, subpath))
            .with_query("page", page.to_string())
            .with_query("size", page_size.to_string());
        Ok(self.pipeline.fetch::<PageBody<R>>(&request).await?.into())
    }

    fn issue(&self) -> u64 {
        let mut tickets = self.tickets.lock();
        tickets.next += 1;
        tickets.next
    }

    fn merge(&self, ticket: u64, entity: R, insert: bool) {
        let id = entity.id().clone();
        let mut tickets = self.tickets.lock();
        let floor = tickets.floor;
        let merged = tickets.merged.entry(id.clone()).or_insert(0);
        if floor > ticket || *merged > ticket {
            tracing::debug!(path = R::PATH, %id, "dropping response superseded by a newer operation");
            return;
        }
        *merged = ticket;

        self.state.update(|listing| {
            match listing.items.iter_mut().find(|item| item.id() == &id) {
                Some(slot) => *slot = entity,
                None if insert => {
                    listing.items.push(entity);
                    listing.total += 1;
                }
                None => tracing::debug!(path = R::PATH, %id, "entity not on the mirrored page, update not mirrored"),
            }
        });
    }
}

pub(crate) fn entity_path<R: Resource>(id: &EntityId) -> String {
    format!("{}/{}", R::PATH, urlencoding::encode(id.as_str()))
}
