//! Option chains, one entry per expiry.

use std::sync::Arc;

use chrono::Duration;
use log::{debug, info};
use quotevault_market_data::{OptionChain, Symbol};

use super::{commit_merge, upstream_failure, DatasetContext, FetchGate, RefreshReport};
use crate::errors::{Error, Result};
use crate::model::{CacheEntry, CacheKey, DatasetKind, Payload, Provenance, SubKey};
use crate::store::CURRENT_SCHEMA_VERSION;

pub struct OptionsManager {
    ctx: Arc<DatasetContext>,
}

impl OptionsManager {
    pub fn new(ctx: Arc<DatasetContext>) -> Self {
        Self { ctx }
    }

    pub(super) async fn refresh(
        &self,
        symbol: &Symbol,
        kind: &DatasetKind,
        sub_key: &SubKey,
        max_age: Option<Duration>,
        gate: &dyn FetchGate,
    ) -> Result<RefreshReport> {
        let DatasetKind::OptionChain { expiry } = kind else {
            return Err(Error::InvalidRequest(format!(
                "{} is not an option chain dataset",
                kind
            )));
        };
        let expiry = *expiry;
        if !self.ctx.provider.capabilities().supports_options {
            return Err(Error::NotSupported(format!(
                "{}: option chains",
                self.ctx.provider_id()
            )));
        }

        let key = CacheKey::new(symbol.ticker.clone(), kind.clone());
        let now = self.ctx.now();
        let lookup = self.ctx.store.read(&key).await?;

        let engine = &self.ctx.engine;
        if engine.is_option_expired(&symbol.exchange, expiry, now)? {
            return match lookup.entry() {
                Some(_) => {
                    debug!("{} expired; serving the final chain", key);
                    Ok(RefreshReport::Expired)
                }
                None => Err(Error::NotFound(format!(
                    "option chain for {} expired on {}",
                    symbol, expiry
                ))),
            };
        }
        if engine
            .evaluate_within(kind, sub_key, lookup.entry(), now, max_age)
            .is_fresh()
        {
            return Ok(RefreshReport::UpToDate);
        }

        gate.admit().await?;
        debug!("Fetching option chain {}", key);
        let chain = self
            .ctx
            .provider
            .fetch_option_chain(symbol, expiry)
            .await
            .map_err(|e| upstream_failure(&key, e))?;
        if chain.expiry != expiry {
            return Err(upstream_failure(
                &key,
                quotevault_market_data::MarketDataError::ValidationFailed {
                    message: format!("asked for expiry {}, got {}", expiry, chain.expiry),
                },
            ));
        }

        let expires_at = engine.option_expiry_close(&symbol.exchange, expiry)?;
        let provider = self.ctx.provider_id();
        let entry = commit_merge(&self.ctx.store, &key, lookup, |current| {
            let provenance = match current {
                Some(current) => Provenance {
                    fetches: current.provenance.fetches + 1,
                    ..current.provenance.clone()
                },
                None => Provenance::new(provider),
            };
            CacheEntry {
                symbol: symbol.clone(),
                kind: kind.clone(),
                sub_key: sub_key.clone(),
                payload: Payload::OptionChain(chain.clone()),
                schema_version: CURRENT_SCHEMA_VERSION,
                last_refresh: now,
                coverage: None,
                provenance,
                expires_at: Some(expires_at),
            }
        })
        .await?;
        info!("Stored {} contracts for {}", entry.payload.len(), key);
        Ok(RefreshReport::Updated { fetches: 1 })
    }

    /// The chain held by `entry`.
    pub fn chain(&self, entry: &CacheEntry) -> Option<OptionChain> {
        match &entry.payload {
            Payload::OptionChain(chain) => Some(chain.clone()),
            _ => None,
        }
    }
}
