use shortlink_core::{Directory, Runtime, RuntimeConfig};
use std::time::Duration;
use tracing::{debug, info};

pub use shortlink_core::{Error as ShortlinkError, Result};

pub mod segment;
pub use segment::RouteSegment;

pub mod statistics;
pub use statistics::{StatisticsClient, StatisticsScope, StatisticsSnapshot};

pub mod short_url;
pub use short_url::{Resolution, ShortUrlEntity, ShortUrlInfo, ShortUrlState};

use statistics::{DomainStatistics, GlobalStatistics, StatisticsState};

/// Attempts at finding an unused random segment in `shorten`
const GENERATE_ATTEMPTS: usize = 5;

/// Shortener handle: the runtime plus the short URL and statistics directories
pub struct Shortener {
    runtime: Runtime,
    urls: Directory<ShortUrlEntity>,
    statistics: StatisticsClient,
}

impl Shortener {
    /// Start a runtime with `config` and register the entity directories
    pub fn open(config: RuntimeConfig) -> Result<Self> {
        let runtime = Runtime::open(config)?;

        let global = runtime.directory(|_, state: Option<StatisticsState>| {
            GlobalStatistics::new(state.unwrap_or_default())
        })?;
        let domains = runtime.directory(|_, state: Option<StatisticsState>| {
            DomainStatistics::new(state.unwrap_or_default())
        })?;
        let statistics = StatisticsClient::new(global, domains);

        let client = statistics.clone();
        let urls = runtime.directory(move |_, state: Option<ShortUrlState>| {
            ShortUrlEntity::new(state.unwrap_or_default(), client.clone())
        })?;

        info!("Shortener ready");
        Ok(Self {
            runtime,
            urls,
            statistics,
        })
    }

    /// Open with in-memory storage and default settings
    pub fn in_memory() -> Result<Self> {
        Self::open(RuntimeConfig::new())
    }

    /// Shorten `url` under a fresh random segment
    pub fn shorten(&self, url: &str, is_one_shot: bool, valid_for_seconds: u64) -> Result<RouteSegment> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let segment = RouteSegment::generate();
            match self.create_short_url(&segment, url, is_one_shot, valid_for_seconds) {
                Ok(()) => return Ok(segment),
                Err(ShortlinkError::AlreadyExists(_)) if attempt < GENERATE_ATTEMPTS => {
                    debug!("Segment {} already taken, generating another", segment);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Create a short URL under a caller-chosen segment. Fails with
    /// `AlreadyExists` if the segment was ever used.
    pub fn create_short_url(
        &self,
        segment: &RouteSegment,
        url: &str,
        is_one_shot: bool,
        valid_for_seconds: u64,
    ) -> Result<()> {
        self.urls.call(segment, |entity, ctx| {
            entity.create_short_url(ctx, url, is_one_shot, valid_for_seconds)
        })
    }

    /// Resolve `segment` to its target URL.
    ///
    /// Fails with `RouteNotFound`, `RouteExpired` or
    /// `InvocationLimitExceeded`, or with a runtime fault.
    pub fn get_url(&self, segment: &RouteSegment) -> Result<String> {
        self.urls
            .call(segment, |entity, ctx| entity.get_url(ctx))?
            .into_result(segment.as_str())
    }

    pub fn describe(&self, segment: &RouteSegment) -> Result<ShortUrlInfo> {
        self.urls.call(segment, |entity, ctx| entity.describe(ctx))
    }

    pub fn global_statistics(&self) -> Result<StatisticsSnapshot> {
        self.statistics.snapshot(&StatisticsScope::Global)
    }

    /// Statistics of `host`. Hosts are matched case-insensitively.
    pub fn domain_statistics(&self, host: &str) -> Result<StatisticsSnapshot> {
        self.statistics.snapshot(&StatisticsScope::domain(host))
    }

    /// Statistics of the domain `url` points at
    pub fn domain_statistics_for_url(&self, url: &str) -> Result<StatisticsSnapshot> {
        self.statistics.snapshot(&StatisticsScope::for_url(url)?)
    }

    pub fn initialize_statistics(&self, scope: &StatisticsScope) -> Result<()> {
        self.statistics.initialize(scope)
    }

    /// Wait until every queued aggregator notification has been applied.
    /// Returns false if `timeout` elapsed first.
    pub fn settle(&self, timeout: Duration) -> bool {
        self.runtime.wait_idle(timeout)
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn urls(&self) -> &Directory<ShortUrlEntity> {
        &self.urls
    }

    pub fn statistics(&self) -> &StatisticsClient {
        &self.statistics
    }

    /// Drain queued notifications and stop the runtime. Reminders stay armed
    /// in storage and fire after the next `open`.
    pub fn shutdown(&self) {
        self.runtime.shutdown();
    }
}

impl Drop for Shortener {
    fn drop(&mut self) {
        self.runtime.shutdown();
    }
}
