//! Cached, coalesced GETs against the backend.
//!
//! UI code asks for data by a logical key ("clients", "staff", "orders/42")
//! and a path. A `NoData` result means "nothing yet, try again later"; it is
//! never an error to surface to the user.

use crate::cache::{FetchOptions, Lookup, RequestCoalescer};
use crate::client::api::ApiClient;
use serde::de::DeserializeOwned;
use std::time::Duration;

#[derive(Clone)]
pub struct CachedApi {
    api: ApiClient,
    cache: RequestCoalescer,
    default_ttl: Duration,
}

impl CachedApi {
    pub fn new(api: ApiClient, cache: RequestCoalescer, default_ttl: Duration) -> Self {
        Self {
            api,
            cache,
            default_ttl,
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.api
    }

    pub fn cache(&self) -> &RequestCoalescer {
        &self.cache
    }

    /// Cached GET with the default TTL.
    pub async fn get<T>(&self, key: &str, path: &str) -> Lookup<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.get_with(key, path, FetchOptions::ttl(self.default_ttl))
            .await
    }

    /// GET that bypasses a fresh cached value. Still throttled and coalesced.
    pub async fn refresh<T>(&self, key: &str, path: &str) -> Lookup<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.get_with(
            key,
            path,
            FetchOptions::ttl(self.default_ttl).force_refresh(true),
        )
        .await
    }

    pub async fn get_with<T>(&self, key: &str, path: &str, options: FetchOptions) -> Lookup<T>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        let api = &self.api;
        self.cache
            .get_or_fetch(key, options, || api.get_json::<T>(path))
            .await
    }

    /// Drop cached entries under `prefix` so the next read refetches.
    pub fn invalidate(&self, prefix: &str) -> usize {
        self.cache.invalidate(prefix)
    }
}
