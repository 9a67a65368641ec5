//! Bearer tokens for authenticated layers.
//!
//! Each token layer gets one slot holding the current token and its expiry.
//! Refreshes are serialized per layer through an async gate: concurrent
//! callers that find the token missing all queue on the gate, the first one
//! refreshes, and the rest re-check the slot and reuse the new token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Deserialize;
use web_time::Instant;

use crate::error::{Error, Result};
use crate::fetch::Fetcher;
use crate::layer::{LayerAuth, LayerRegistry};

/// Tokens are treated as expired this long before their stated expiry, so a
/// request never leaves with a token that dies in flight.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

/// A token issued by a refresh endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// The bearer token.
    pub token: String,
    /// Lifetime stated by the endpoint, if any.
    pub expires_in: Option<Duration>,
}

#[derive(Deserialize)]
struct GrantBody {
    #[serde(alias = "access_token")]
    token: String,
    #[serde(default)]
    expires_in: Option<f64>,
}

impl TokenGrant {
    /// Parse a refresh response.
    ///
    /// Accepts a JSON object with `token` (or `access_token`) and an optional
    /// `expires_in` in seconds, or a bare token as plain text.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is empty or not valid UTF-8.
    pub fn parse(layer: &str, body: &[u8]) -> Result<Self> {
        if let Ok(grant) = serde_json::from_slice::<GrantBody>(body) {
            return Ok(Self {
                token: grant.token,
                expires_in: grant
                    .expires_in
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok()),
            });
        }

        let text = std::str::from_utf8(body).map_err(|e| Error::Auth {
            layer: layer.to_string(),
            detail: format!("refresh response is not text: {e}"),
        })?;
        let token = text.trim();
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(Error::Auth {
                layer: layer.to_string(),
                detail: "refresh response did not contain a token".to_string(),
            });
        }
        Ok(Self {
            token: token.to_string(),
            expires_in: None,
        })
    }
}

#[derive(Debug)]
struct TokenSlot {
    token: Option<String>,
    expires_at: Option<Instant>,
    refresh_url: String,
    refresh_interval: Duration,
    refreshes: u64,
}

impl TokenSlot {
    fn valid_token(&self, now: Instant) -> Option<&str> {
        let token = self.token.as_deref()?;
        match self.expires_at {
            Some(expires_at) if now + EXPIRY_MARGIN >= expires_at => None,
            _ => Some(token),
        }
    }
}

/// Holds the current token of every token layer.
#[derive(Debug, Default)]
pub struct TokenStore {
    slots: Mutex<HashMap<String, TokenSlot>>,
    /// Per-layer refresh gates. The map itself never changes after
    /// construction.
    gates: HashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenStore {
    /// Create slots for every token layer in `registry`.
    #[must_use]
    pub fn from_registry(registry: &LayerRegistry) -> Self {
        let now = Instant::now();
        let mut slots = HashMap::new();
        let mut gates = HashMap::new();
        for layer in registry.iter() {
            if let LayerAuth::Token {
                token,
                refresh_url,
                refresh_interval,
            } = &layer.auth
            {
                slots.insert(
                    layer.layer_type.clone(),
                    TokenSlot {
                        token: token.clone(),
                        expires_at: token.as_ref().map(|_| now + *refresh_interval),
                        refresh_url: refresh_url.clone(),
                        refresh_interval: *refresh_interval,
                        refreshes: 0,
                    },
                );
                gates.insert(layer.layer_type.clone(), Arc::default());
            }
        }
        Self {
            slots: Mutex::new(slots),
            gates,
        }
    }

    /// Whether `layer` has a token slot.
    #[must_use]
    pub fn has_layer(&self, layer: &str) -> bool {
        self.gates.contains_key(layer)
    }

    /// The current token if it has not expired.
    #[must_use]
    pub fn current(&self, layer: &str) -> Option<String> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots
            .get(layer)
            .and_then(|slot| slot.valid_token(Instant::now()))
            .map(str::to_string)
    }

    /// Install a token obtained out of band. It is assumed to live for the
    /// layer's refresh interval.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `layer` is not a token layer.
    pub fn set_token(&self, layer: &str, token: String) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get_mut(layer).ok_or_else(|| Error::Config {
            context: "layer token",
            detail: format!("layer '{layer}' does not use token authentication"),
        })?;
        slot.expires_at = Some(Instant::now() + slot.refresh_interval);
        slot.token = Some(token);
        Ok(())
    }

    /// Number of successful refreshes performed for `layer`.
    #[must_use]
    pub fn refresh_count(&self, layer: &str) -> u64 {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(layer).map_or(0, |slot| slot.refreshes)
    }

    /// A valid token for `layer`, refreshing it first if it is missing or
    /// expired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the refresh fails.
    pub async fn token(&self, layer: &str, fetcher: &dyn Fetcher) -> Result<String> {
        if let Some(token) = self.current(layer) {
            return Ok(token);
        }
        let gate = self.gate(layer)?;
        let _guard = gate.lock().await;
        // Another caller may have refreshed while this one waited.
        if let Some(token) = self.current(layer) {
            return Ok(token);
        }
        self.refresh(layer, fetcher).await
    }

    /// Replace a token the server rejected.
    ///
    /// If another caller already replaced `rejected`, the newer token is
    /// returned without a second refresh.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] if the refresh fails.
    pub async fn refresh_after_rejection(
        &self,
        layer: &str,
        rejected: &str,
        fetcher: &dyn Fetcher,
    ) -> Result<String> {
        let gate = self.gate(layer)?;
        let _guard = gate.lock().await;
        if let Some(token) = self.current(layer)
            && token != rejected
        {
            return Ok(token);
        }
        self.invalidate(layer);
        self.refresh(layer, fetcher).await
    }

    fn gate(&self, layer: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        self.gates.get(layer).cloned().ok_or_else(|| Error::Auth {
            layer: layer.to_string(),
            detail: "layer has no token slot".to_string(),
        })
    }

    fn invalidate(&self, layer: &str) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = slots.get_mut(layer) {
            slot.token = None;
            slot.expires_at = None;
        }
    }

    /// Fetch a new token. Callers hold the layer's gate.
    async fn refresh(&self, layer: &str, fetcher: &dyn Fetcher) -> Result<String> {
        let refresh_url = {
            let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            match slots.get(layer) {
                Some(slot) => slot.refresh_url.clone(),
                None => {
                    return Err(Error::Auth {
                        layer: layer.to_string(),
                        detail: "layer has no token slot".to_string(),
                    });
                }
            }
        };

        tracing::info!(layer, "Refreshing token");
        let response = fetcher
            .get(&refresh_url, None)
            .await
            .map_err(|e| Error::Auth {
                layer: layer.to_string(),
                detail: format!("refresh request failed: {e}"),
            })?;
        if !response.is_success() {
            return Err(Error::Auth {
                layer: layer.to_string(),
                detail: format!("refresh endpoint returned status {}", response.status),
            });
        }
        let grant = TokenGrant::parse(layer, &response.body)?;

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get_mut(layer).ok_or_else(|| Error::Auth {
            layer: layer.to_string(),
            detail: "layer has no token slot".to_string(),
        })?;
        let lifetime = grant.expires_in.unwrap_or(slot.refresh_interval);
        slot.token = Some(grant.token.clone());
        slot.expires_at = Some(Instant::now() + lifetime);
        slot.refreshes += 1;
        tracing::debug!(layer, lifetime_secs = lifetime.as_secs_f64(), "Token refreshed");
        Ok(grant.token)
    }
}
