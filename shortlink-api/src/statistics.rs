/// Statistics aggregators
///
/// One aggregator entity per scope: a single global one, and one per
/// hostname. Short URLs tell them about registrations and expiries with
/// one-way messages, so the counters trail the short URLs by the delivery
/// lag and converge once the dispatcher drains.

use serde::{Deserialize, Serialize};
use shortlink_core::{Directory, Entity, EntityContext, EntityKind, Error, Result};
use std::marker::PhantomData;
use tracing::{debug, warn};
use url::Url;

/// Key of the global aggregator
pub const GLOBAL_KEY: &str = "global";

/// Which aggregator a query or notification is for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatisticsScope {
    Global,
    Domain(String),
}

impl StatisticsScope {
    /// Domain scope of the host in `url`
    pub fn for_url(url: &str) -> Result<Self> {
        domain_of(url).map(StatisticsScope::Domain)
    }

    /// Domain scope of `host`, in the lowercase form used as the key
    pub fn domain(host: &str) -> Self {
        StatisticsScope::Domain(domain_key(host))
    }
}

/// Hosts compare case-insensitively; `url` already lowercases the ones it parses
fn domain_key(host: &str) -> String {
    host.to_ascii_lowercase()
}

/// Host part of an absolute URL, as used for domain aggregator keys
pub fn domain_of(url: &str) -> Result<String> {
    let parsed =
        Url::parse(url).map_err(|e| Error::InvalidArgument(format!("invalid url {:?}: {}", url, e)))?;
    match parsed.host_str() {
        Some(host) if !host.is_empty() => Ok(host.to_string()),
        _ => Err(Error::InvalidArgument(format!("url {:?} has no host", url))),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsState {
    pub initialized: bool,
    pub total_registrations: u64,
    pub active_count: u64,
}

/// Point-in-time counters of one aggregator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub total: u64,
    pub active: u64,
}

/// Entity kind an aggregator lives under
pub trait AggregatorKind: Clone + Send + 'static {
    const KIND: EntityKind;
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalKind;

impl AggregatorKind for GlobalKind {
    const KIND: EntityKind = EntityKind::Statistics;
}

#[derive(Debug, Clone, Copy)]
pub struct DomainKind;

impl AggregatorKind for DomainKind {
    const KIND: EntityKind = EntityKind::Domain;
}

/// Registration counters for one scope
#[derive(Debug, Clone)]
pub struct StatisticsAggregator<K> {
    state: StatisticsState,
    _kind: PhantomData<K>,
}

pub type GlobalStatistics = StatisticsAggregator<GlobalKind>;
pub type DomainStatistics = StatisticsAggregator<DomainKind>;

impl<K: AggregatorKind> StatisticsAggregator<K> {
    pub fn new(state: StatisticsState) -> Self {
        Self {
            state,
            _kind: PhantomData,
        }
    }

    /// Idempotent
    pub fn initialize(&mut self) {
        self.state.initialized = true;
    }

    pub fn register_new(&mut self) {
        self.state.initialized = true;
        self.state.total_registrations += 1;
        self.state.active_count += 1;
    }

    /// Floored at zero
    pub fn unregister(&mut self) {
        if self.state.active_count == 0 {
            warn!("Unregister on a {} aggregator with no active registrations", K::KIND);
            return;
        }
        self.state.active_count -= 1;
    }

    pub fn get_total(&self) -> u64 {
        self.state.total_registrations
    }

    pub fn get_number_of_active_shortened_route_segment(&self) -> u64 {
        self.state.active_count
    }

    pub fn is_initialized(&self) -> bool {
        self.state.initialized
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total: self.state.total_registrations,
            active: self.state.active_count,
        }
    }
}

impl<K: AggregatorKind> Entity for StatisticsAggregator<K> {
    type State = StatisticsState;
    const KIND: EntityKind = K::KIND;

    fn snapshot(&self) -> StatisticsState {
        self.state
    }

    fn receive_reminder(&mut self, ctx: &EntityContext<'_, Self>, name: &str) -> Result<()> {
        debug!("Aggregator {} ignoring reminder {}", ctx.id(), name);
        Ok(())
    }
}

/// Both aggregator directories, as used by short URLs and the facade
#[derive(Clone)]
pub struct StatisticsClient {
    global: Directory<GlobalStatistics>,
    domains: Directory<DomainStatistics>,
}

impl StatisticsClient {
    pub fn new(global: Directory<GlobalStatistics>, domains: Directory<DomainStatistics>) -> Self {
        Self { global, domains }
    }

    /// Queue one registration at the global aggregator and the one for `domain`
    pub fn notify_register<E: Entity>(&self, ctx: &EntityContext<'_, E>, domain: &str) {
        ctx.tell(&self.global, GLOBAL_KEY, |aggregator, _| {
            aggregator.register_new();
            Ok(())
        });
        ctx.tell(&self.domains, domain, |aggregator, _| {
            aggregator.register_new();
            Ok(())
        });
    }

    /// Queue one expiry at the global aggregator and the one for `domain`
    pub fn notify_unregister<E: Entity>(&self, ctx: &EntityContext<'_, E>, domain: &str) {
        ctx.tell(&self.global, GLOBAL_KEY, |aggregator, _| {
            aggregator.unregister();
            Ok(())
        });
        ctx.tell(&self.domains, domain, |aggregator, _| {
            aggregator.unregister();
            Ok(())
        });
    }

    pub fn initialize(&self, scope: &StatisticsScope) -> Result<()> {
        match scope {
            StatisticsScope::Global => self.global.call(GLOBAL_KEY, |a, _| {
                a.initialize();
                Ok(())
            }),
            StatisticsScope::Domain(host) => self.domains.call(domain_key(host), |a, _| {
                a.initialize();
                Ok(())
            }),
        }
    }

    /// Current counters for `scope`. A scope nothing was ever registered
    /// against reads as zero.
    pub fn snapshot(&self, scope: &StatisticsScope) -> Result<StatisticsSnapshot> {
        match scope {
            StatisticsScope::Global => self.global.call(GLOBAL_KEY, |a, _| Ok(a.snapshot())),
            StatisticsScope::Domain(host) => self.domains.call(domain_key(host), |a, _| Ok(a.snapshot())),
        }
    }

    pub fn global(&self) -> &Directory<GlobalStatistics> {
        &self.global
    }

    pub fn domains(&self) -> &Directory<DomainStatistics> {
        &self.domains
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use shortlink_core::{Runtime, RuntimeConfig};
    use std::thread;
    use std::time::Duration;

    fn client(runtime: &Runtime) -> StatisticsClient {
        let global = runtime
            .directory(|_, state: Option<StatisticsState>| {
                GlobalStatistics::new(state.unwrap_or_default())
            })
            .unwrap();
        let domains = runtime
            .directory(|_, state: Option<StatisticsState>| {
                DomainStatistics::new(state.unwrap_or_default())
            })
            .unwrap();
        StatisticsClient::new(global, domains)
    }

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("https://capitalecultura2023.it/").unwrap(), "capitalecultura2023.it");
        assert_eq!(domain_of("http://Example.COM:8080/a?b=c").unwrap(), "example.com");
        assert!(domain_of("not a url").is_err());
        assert!(domain_of("mailto:someone@example.com").is_err());
    }

    #[test]
    fn test_counters() {
        let mut aggregator = GlobalStatistics::new(StatisticsState::default());
        assert!(!aggregator.is_initialized());

        aggregator.register_new();
        aggregator.register_new();
        aggregator.unregister();
        assert!(aggregator.is_initialized());
        assert_eq!(aggregator.get_total(), 2);
        assert_eq!(aggregator.get_number_of_active_shortened_route_segment(), 1);

        aggregator.unregister();
        aggregator.unregister();
        assert_eq!(aggregator.snapshot(), StatisticsSnapshot { total: 2, active: 0 });
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let stats = client(&runtime);

        stats.initialize(&StatisticsScope::Global).unwrap();
        stats.global().call(GLOBAL_KEY, |a, _| {
            a.register_new();
            Ok(())
        })
        .unwrap();
        stats.initialize(&StatisticsScope::Global).unwrap();

        let snapshot = stats.snapshot(&StatisticsScope::Global).unwrap();
        assert_eq!(snapshot, StatisticsSnapshot { total: 1, active: 1 });
        runtime.shutdown();
    }

    #[test]
    fn test_scopes_are_independent() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let stats = client(&runtime);

        // A host named like the global key is still its own aggregator
        stats.domains().call(GLOBAL_KEY, |a, _| {
            a.register_new();
            Ok(())
        })
        .unwrap();

        assert_eq!(stats.snapshot(&StatisticsScope::Global).unwrap().total, 0);
        assert_eq!(
            stats.snapshot(&StatisticsScope::Domain(GLOBAL_KEY.to_string())).unwrap().total,
            1
        );
        runtime.shutdown();
    }

    #[test]
    fn test_concurrent_register_new() {
        let runtime = Runtime::open(RuntimeConfig::new()).unwrap();
        let stats = client(&runtime);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let global = stats.global().clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        global
                            .tell(GLOBAL_KEY, |a, _| {
                                a.register_new();
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(runtime.wait_idle(Duration::from_secs(5)));
        let snapshot = stats.snapshot(&StatisticsScope::Global).unwrap();
        assert_eq!(snapshot, StatisticsSnapshot { total: 500, active: 500 });
        runtime.shutdown();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Register,
        Unregister,
    }

    proptest! {
        #[test]
        fn prop_active_never_exceeds_total(ops in prop::collection::vec(
            prop_oneof![Just(Op::Register), Just(Op::Unregister)],
            0..200,
        )) {
            let mut aggregator = DomainStatistics::new(StatisticsState::default());
            let mut last_total = 0;
            let mut registered = 0u64;

            for op in ops {
                match op {
                    Op::Register => {
                        aggregator.register_new();
                        registered += 1;
                    }
                    Op::Unregister => aggregator.unregister(),
                }
                let snapshot = aggregator.snapshot();
                prop_assert!(snapshot.active <= snapshot.total);
                prop_assert!(snapshot.total >= last_total);
                last_total = snapshot.total;
            }

            prop_assert_eq!(aggregator.get_total(), registered);
        }
    }
}
