//! Registry of in-flight requests, keyed by request identifier.
//!
//! Each entry holds the request's [`CancellationToken`] and the chat it
//! belongs to, if any. Cancelling removes the entry and fires the token in
//! one step under the lock, so a request is cancelled at most once.
//!
//! [`ActiveRequests::register`] returns a [`RequestGuard`]; dropping the
//! guard deregisters the request once its pipeline has finished and
//! resolves its [`Completion`]. A chat has at most one entry:
//! [`ActiveRequests::register_for_chat`] supersedes the chat's previous
//! request under the same lock that inserts the new one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{AppError, Result};

#[derive(Debug)]
struct ActiveEntry {
    token: CancellationToken,
    done: CancellationToken,
    chat_id: Option<String>,
    generation: u64,
}

/// Resolves once a request's guard has been dropped.
#[derive(Debug, Clone)]
pub struct Completion(CancellationToken);

impl Completion {
    /// Wait until the request has finished.
    pub async fn finished(&self) {
        self.0.cancelled().await;
    }

    /// Whether the request has already finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.0.is_cancelled()
    }
}

type EntryMap = HashMap<String, ActiveEntry>;

/// Shared, cheaply cloneable map of in-flight requests.
#[derive(Debug, Clone, Default)]
pub struct ActiveRequests {
    entries: Arc<Mutex<EntryMap>>,
    generations: Arc<AtomicU64>,
}

impl ActiveRequests {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EntryMap> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `request_id` and return the guard owning its token.
    ///
    /// Reusing an identifier that is still in flight cancels the older request.
    #[must_use]
    pub fn register(&self, request_id: &str, chat_id: Option<&str>) -> RequestGuard {
        let mut entries = self.lock();
        self.insert_locked(&mut entries, request_id, chat_id)
    }

    /// Register `request_id` as the only in-flight request of `chat_id`.
    ///
    /// Requests already running for the chat are cancelled and removed in the
    /// same critical section. Their completions are returned so the caller can
    /// wait for them to finish writing before touching the chat.
    #[must_use]
    pub fn register_for_chat(
        &self,
        request_id: &str,
        chat_id: &str,
    ) -> (RequestGuard, Vec<Completion>) {
        let mut entries = self.lock();
        let superseded = take_chat_entries(&mut entries, chat_id);
        let guard = self.insert_locked(&mut entries, request_id, Some(chat_id));
        drop(entries);

        let completions = superseded
            .into_iter()
            .map(|(id, entry)| {
                info!(request_id = %id, chat_id, "superseded request cancelled");
                entry.token.cancel();
                Completion(entry.done)
            })
            .collect();
        (guard, completions)
    }

    fn insert_locked(
        &self,
        entries: &mut EntryMap,
        request_id: &str,
        chat_id: Option<&str>,
    ) -> RequestGuard {
        let token = CancellationToken::new();
        let done = CancellationToken::new();
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let previous = entries.insert(
            request_id.to_owned(),
            ActiveEntry {
                token: token.clone(),
                done: done.clone(),
                chat_id: chat_id.map(str::to_owned),
                generation,
            },
        );
        if let Some(previous) = previous {
            info!(request_id, "request id reused; cancelling previous request");
            previous.token.cancel();
        }
        debug!(request_id, ?chat_id, "request registered");

        RequestGuard {
            registry: self.clone(),
            request_id: request_id.to_owned(),
            token,
            done,
            generation,
        }
    }

    /// Cancel an in-flight request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no request with that identifier is active.
    pub fn cancel(&self, request_id: &str) -> Result<()> {
        let entry = self
            .lock()
            .remove(request_id)
            .ok_or_else(|| AppError::NotFound("Request not found".into()))?;
        entry.token.cancel();
        info!(request_id, "request cancelled");
        Ok(())
    }

    /// Cancel every in-flight request bound to `chat_id`. Returns how many.
    pub fn cancel_for_chat(&self, chat_id: &str) -> usize {
        let cancelled = take_chat_entries(&mut self.lock(), chat_id);
        for (request_id, entry) in &cancelled {
            info!(%request_id, chat_id, "chat request cancelled");
            entry.token.cancel();
        }
        cancelled.len()
    }

    /// Cancel everything in flight, e.g. on shutdown. Returns how many.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<ActiveEntry> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.token.cancel();
        }
        drained.len()
    }

    /// Whether `request_id` is in flight.
    #[must_use]
    pub fn contains(&self, request_id: &str) -> bool {
        self.lock().contains_key(request_id)
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn deregister(&self, request_id: &str, generation: u64) {
        let mut entries = self.lock();
        if entries
            .get(request_id)
            .is_some_and(|entry| entry.generation == generation)
        {
            entries.remove(request_id);
            debug!(request_id, "request deregistered");
        }
    }
}

/// Ownership of one registered request; deregisters it on drop.
#[derive(Debug)]
pub struct RequestGuard {
    registry: ActiveRequests,
    request_id: String,
    token: CancellationToken,
    done: CancellationToken,
    generation: u64,
}

impl RequestGuard {
    /// Identifier the request was registered under.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The request's cancellation token.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Completion that resolves when this guard is dropped.
    #[must_use]
    pub fn completion(&self) -> Completion {
        Completion(self.done.clone())
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.registry.deregister(&self.request_id, self.generation);
        self.done.cancel();
    }
}

fn take_chat_entries(entries: &mut EntryMap, chat_id: &str) -> Vec<(String, ActiveEntry)> {
    let ids: Vec<String> = entries
        .iter()
        .filter(|(_, entry)| entry.chat_id.as_deref() == Some(chat_id))
        .map(|(id, _)| id.clone())
        .collect();
    ids.into_iter()
        .filter_map(|id| entries.remove(&id).map(|entry| (id, entry)))
        .collect()
}
