/// Short URL entity
///
/// Lifecycle: created once, resolved any number of times while live, and
/// expired exactly once, either by its TTL reminder, by a read that finds
/// the TTL already elapsed, or by the first resolution of a one-shot URL.
/// Whichever path expires it sends the single unregister notification; the
/// persisted `unregistered` flag keeps the others from sending another.
/// Expired short URLs keep their state, so they answer `Expired` forever.

use crate::statistics::{domain_of, StatisticsClient};
use serde::{Deserialize, Serialize};
use shortlink_core::{now_millis, Entity, EntityContext, EntityKind, Error, Result};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the TTL reminder
pub const EXPIRE_REMINDER: &str = "expire";

/// Longest accepted TTL, one hundred years
pub const MAX_VALID_FOR_SECONDS: u64 = 100 * 365 * 24 * 60 * 60;

/// Longest accepted target URL, in bytes
pub const MAX_URL_LEN: usize = 8 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortUrlState {
    /// False until `create_short_url` succeeds on this key
    pub created: bool,
    pub target_url: String,
    pub is_one_shot: bool,
    pub valid_for_seconds: u64,
    pub invocation_count: u64,
    pub expired: bool,
    /// Host of `target_url`; the domain aggregator this URL reports to
    pub created_at_domain: String,
    pub created_at_ms: u64,
    /// Set when the unregister notification has been sent
    pub unregistered: bool,
}

impl ShortUrlState {
    pub fn expires_at_ms(&self) -> u64 {
        self.created_at_ms
            .saturating_add(self.valid_for_seconds.saturating_mul(1000))
    }

    fn ttl_elapsed(&self, now_ms: u64) -> bool {
        now_ms > self.expires_at_ms()
    }
}

/// Outcome of resolving a short URL.
///
/// Resolution can expire the entity, and that change has to be committed,
/// so the entity reports outcomes as values; `into_result` turns them into
/// the caller-facing errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Target(String),
    NotFound,
    Expired,
    LimitExceeded,
}

impl Resolution {
    pub fn into_result(self, key: &str) -> Result<String> {
        match self {
            Resolution::Target(url) => Ok(url),
            Resolution::NotFound => Err(Error::RouteNotFound(key.to_string())),
            Resolution::Expired => Err(Error::RouteExpired(key.to_string())),
            Resolution::LimitExceeded => Err(Error::InvocationLimitExceeded(key.to_string())),
        }
    }
}

/// Read-only view of a short URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortUrlInfo {
    pub key: String,
    pub target_url: String,
    pub is_one_shot: bool,
    pub valid_for_seconds: u64,
    pub invocation_count: u64,
    /// Also true once the TTL has elapsed, before the entity notices
    pub expired: bool,
    pub domain: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

#[derive(Clone)]
pub struct ShortUrlEntity {
    state: ShortUrlState,
    statistics: StatisticsClient,
}

impl ShortUrlEntity {
    pub fn new(state: ShortUrlState, statistics: StatisticsClient) -> Self {
        Self { state, statistics }
    }

    pub fn state(&self) -> &ShortUrlState {
        &self.state
    }

    /// Create the short URL on this key and register it with the global
    /// aggregator and the aggregator of its host. A key is created at most
    /// once: a second create fails with `AlreadyExists`, expired or not.
    pub fn create_short_url(
        &mut self,
        ctx: &EntityContext<'_, Self>,
        url: &str,
        is_one_shot: bool,
        valid_for_seconds: u64,
    ) -> Result<()> {
        if self.state.created {
            return Err(Error::AlreadyExists(format!("short url {}", ctx.key())));
        }
        if valid_for_seconds == 0 {
            return Err(Error::InvalidArgument(
                "valid_for_seconds must be greater than 0".to_string(),
            ));
        }
        if valid_for_seconds > MAX_VALID_FOR_SECONDS {
            return Err(Error::InvalidArgument(format!(
                "valid_for_seconds must be at most {}",
                MAX_VALID_FOR_SECONDS
            )));
        }
        if url.len() > MAX_URL_LEN {
            return Err(Error::InvalidArgument(format!(
                "url is {} bytes, at most {} are allowed",
                url.len(),
                MAX_URL_LEN
            )));
        }
        let domain = domain_of(url)?;

        self.state = ShortUrlState {
            created: true,
            target_url: url.to_string(),
            is_one_shot,
            valid_for_seconds,
            invocation_count: 0,
            expired: false,
            created_at_domain: domain,
            created_at_ms: now_millis(),
            unregistered: false,
        };

        self.statistics
            .notify_register(ctx, &self.state.created_at_domain);
        ctx.register_reminder(EXPIRE_REMINDER, Duration::from_secs(valid_for_seconds));

        info!(
            "Created short url {} -> {} (one-shot: {}, ttl: {}s)",
            ctx.key(),
            url,
            is_one_shot,
            valid_for_seconds
        );
        Ok(())
    }

    /// Resolve to the target URL
    pub fn get_url(&mut self, ctx: &EntityContext<'_, Self>) -> Result<Resolution> {
        if !self.state.created {
            return Ok(Resolution::NotFound);
        }

        // The reminder may not have fired yet
        if self.state.expired || self.state.ttl_elapsed(now_millis()) {
            self.expire(ctx);
            return Ok(Resolution::Expired);
        }

        if self.state.is_one_shot && self.state.invocation_count >= 1 {
            return Ok(Resolution::LimitExceeded);
        }

        self.state.invocation_count += 1;
        if self.state.is_one_shot {
            self.expire(ctx);
        }
        Ok(Resolution::Target(self.state.target_url.clone()))
    }

    pub fn describe(&self, ctx: &EntityContext<'_, Self>) -> Result<ShortUrlInfo> {
        if !self.state.created {
            return Err(Error::RouteNotFound(ctx.key().to_string()));
        }
        Ok(ShortUrlInfo {
            key: ctx.key().to_string(),
            target_url: self.state.target_url.clone(),
            is_one_shot: self.state.is_one_shot,
            valid_for_seconds: self.state.valid_for_seconds,
            invocation_count: self.state.invocation_count,
            expired: self.state.expired || self.state.ttl_elapsed(now_millis()),
            domain: self.state.created_at_domain.clone(),
            created_at_ms: self.state.created_at_ms,
            expires_at_ms: self.state.expires_at_ms(),
        })
    }

    fn expire(&mut self, ctx: &EntityContext<'_, Self>) {
        if !self.state.expired {
            self.state.expired = true;
            info!("Short url {} expired", ctx.key());
        }
        if self.state.unregistered {
            return;
        }
        self.state.unregistered = true;

        self.statistics
            .notify_unregister(ctx, &self.state.created_at_domain);
        ctx.unregister_reminder(EXPIRE_REMINDER);
        ctx.register_timer(ctx.config().expired_linger, |_, ctx| {
            ctx.deactivate_on_idle();
            Ok(())
        });
    }
}

impl Entity for ShortUrlEntity {
    type State = ShortUrlState;
    const KIND: EntityKind = EntityKind::ShortUrl;

    fn snapshot(&self) -> ShortUrlState {
        self.state.clone()
    }

    fn receive_reminder(&mut self, ctx: &EntityContext<'_, Self>, name: &str) -> Result<()> {
        if name != EXPIRE_REMINDER {
            warn!("Short url {} got unknown reminder {}", ctx.key(), name);
            return Ok(());
        }
        if !self.state.created {
            debug!("Expire reminder for uncreated short url {}", ctx.key());
            return Ok(());
        }
        self.expire(ctx);
        Ok(())
    }
}
