// src/cache.rs
//
// Cache-aside lookup with load coalescing.
//
// `AutoCache::get` asks the provider first. On a miss, concurrent callers for
// the same key share one loader call through an in-flight registry: the first
// caller (the owner) runs the load and writes the result back, later callers
// wait on the owner's result slot. The owner settles the slot, wakes every
// waiter, then removes the record, so the next miss starts a fresh load.

pub mod memory;

use crate::context::Context;
use crate::error::{ImageDeliveryError, Result};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub use memory::MemoryCache;

/// Key/value store behind the cache.
///
/// `get` returns `Ok(None)` when the key is absent; `Err` means the store itself failed.
pub trait CacheProvider: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;
    fn set(&self, key: &str, data: Bytes) -> Result<()>;
    fn shutdown(&self);
}

/// Produces the bytes for a key that is not cached yet.
pub trait Loader: Send + Sync {
    fn load(&self, ctx: &Context, key: &str) -> Result<Bytes>;
}

impl<F> Loader for F
where
    F: Fn(&Context, &str) -> Result<Bytes> + Send + Sync,
{
    fn load(&self, ctx: &Context, key: &str) -> Result<Bytes> {
        self(ctx, key)
    }
}

struct Flight {
    slot: Mutex<Option<Result<Bytes>>>,
    ready: Condvar,
    #[cfg(test)]
    waiters: AtomicUsize,
}

impl Flight {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
            #[cfg(test)]
            waiters: AtomicUsize::new(0),
        }
    }

    fn settle(&self, result: Result<Bytes>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Bytes> {
        #[cfg(test)]
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let mut slot = self.slot.lock();
        loop {
            if let Some(result) = slot.as_ref() {
                return result.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

/// Cache-aside wrapper with per-key load coalescing.
pub struct AutoCache {
    provider: Arc<dyn CacheProvider>,
    loader: Arc<dyn Loader>,
    in_flight: Mutex<HashMap<String, Arc<Flight>>>,
}

impl AutoCache {
    pub fn new(provider: Arc<dyn CacheProvider>, loader: Arc<dyn Loader>) -> Self {
        Self {
            provider,
            loader,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Return the bytes for `key`, loading and caching them on a miss.
    ///
    /// Provider failures other than "absent" are returned as-is without loading.
    /// Every caller coalesced onto one load observes the same result, including
    /// a loader or write-back error.
    pub fn get(&self, ctx: &Context, key: &str) -> Result<Bytes> {
        if let Some(data) = self.provider.get(key)? {
            debug!(key, "cache hit");
            return Ok(data);
        }

        let (flight, owner) = self.join(key);
        if !owner {
            debug!(key, "joining in-flight load");
            return flight.wait();
        }

        debug!(key, "cache miss, loading");
        let mut guard = FlightGuard {
            cache: self,
            key,
            flight: &flight,
            settled: false,
        };
        let result = self.load_and_store(ctx, key);
        guard.finish(result.clone());
        result
    }

    fn load_and_store(&self, ctx: &Context, key: &str) -> Result<Bytes> {
        let data = self.loader.load(ctx, key).map_err(|err| {
            debug!(key, error = %err, "load failed");
            err
        })?;
        if let Err(err) = self.provider.set(key, data.clone()) {
            warn!(key, error = %err, "failed to write loaded data to cache");
            return Err(err);
        }
        Ok(data)
    }

    fn join(&self, key: &str) -> (Arc<Flight>, bool) {
        let mut map = self.in_flight.lock();
        if let Some(existing) = map.get(key) {
            return (Arc::clone(existing), false);
        }
        let flight = Arc::new(Flight::new());
        map.insert(key.to_string(), Arc::clone(&flight));
        (flight, true)
    }

    fn remove(&self, key: &str, flight: &Arc<Flight>) {
        let mut map = self.in_flight.lock();
        if map.get(key).is_some_and(|f| Arc::ptr_eq(f, flight)) {
            map.remove(key);
        }
    }

    pub fn shutdown(&self) {
        self.provider.shutdown();
    }

    #[cfg(test)]
    fn waiting_on(&self, key: &str) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map(|f| f.waiters.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().len()
    }
}

/// Settles and removes the owner's record, also when the loader unwinds.
struct FlightGuard<'a> {
    cache: &'a AutoCache,
    key: &'a str,
    flight: &'a Arc<Flight>,
    settled: bool,
}

impl FlightGuard<'_> {
    fn finish(&mut self, result: Result<Bytes>) {
        self.flight.settle(result);
        self.cache.remove(self.key, self.flight);
        self.settled = true;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.flight.settle(Err(ImageDeliveryError::internal_panic(format!(
                "cache load for '{}' panicked",
                self.key
            ))));
            self.cache.remove(self.key, self.flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Provider keyed on magic names: "notfound"/"notfounderr"/"seterror" miss,
    /// "error" fails, everything else hits with "foo".
    struct ScriptedProvider;

    impl CacheProvider for ScriptedProvider {
        fn get(&self, key: &str) -> Result<Option<Bytes>> {
            match key {
                "notfound" | "notfounderr" | "seterror" => Ok(None),
                "error" => Err(ImageDeliveryError::provider("error")),
                _ => Ok(Some(Bytes::from_static(b"foo"))),
            }
        }

        fn set(&self, key: &str, _data: Bytes) -> Result<()> {
            if key == "seterror" {
                return Err(ImageDeliveryError::provider("seterror"));
            }
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn scripted_loader(_ctx: &Context, key: &str) -> Result<Bytes> {
        if key == "notfounderr" {
            return Err(ImageDeliveryError::loader("notfounderr"));
        }
        Ok(Bytes::from_static(b"foo"))
    }

    fn wait_for_waiters(cache: &AutoCache, key: &str, expected: usize) {
        let start = Instant::now();
        while cache.waiting_on(key) < expected {
            assert!(
                start.elapsed() < Duration::from_secs(10),
                "waiters never joined"
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    mod lookups {
        use super::*;

        #[test]
        fn scripted_keys() {
            let cache = AutoCache::new(Arc::new(ScriptedProvider), Arc::new(scripted_loader));
            let ctx = Context::background();

            assert_eq!(cache.get(&ctx, "hit").unwrap(), Bytes::from_static(b"foo"));
            assert_eq!(
                cache.get(&ctx, "notfound").unwrap(),
                Bytes::from_static(b"foo")
            );
            assert_eq!(
                cache.get(&ctx, "notfounderr").unwrap_err().to_string(),
                "notfounderr"
            );
            assert_eq!(
                cache.get(&ctx, "error").unwrap_err().to_string(),
                "cache provider error: error"
            );
            assert_eq!(
                cache.get(&ctx, "seterror").unwrap_err().to_string(),
                "cache provider error: seterror"
            );
            assert_eq!(cache.in_flight_len(), 0);
        }

        #[test]
        fn provider_failure_skips_loader() {
            let loads = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&loads);
            let cache = AutoCache::new(
                Arc::new(ScriptedProvider),
                Arc::new(move |_ctx: &Context, _key: &str| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"x"))
                }),
            );
            assert!(cache.get(&Context::background(), "error").is_err());
            assert_eq!(loads.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn second_get_hits_provider_without_loading() {
            let loads = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&loads);
            let cache = AutoCache::new(
                Arc::new(MemoryCache::new()),
                Arc::new(move |_ctx: &Context, _key: &str| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::from_static(b"x"))
                }),
            );
            let ctx = Context::background();

            assert_eq!(cache.get(&ctx, "missing-key").unwrap(), "x");
            assert_eq!(cache.get(&ctx, "missing-key").unwrap(), "x");
            assert_eq!(loads.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn loader_error_is_not_cached() {
            let loads = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&loads);
            let provider = Arc::new(MemoryCache::new());
            let cache = AutoCache::new(
                provider.clone(),
                Arc::new(move |_ctx: &Context, _key: &str| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Err(ImageDeliveryError::storage_not_found("k"))
                }),
            );
            let ctx = Context::background();

            assert!(cache.get(&ctx, "k").unwrap_err().is_not_found());
            assert!(cache.get(&ctx, "k").is_err());
            assert_eq!(loads.load(Ordering::SeqCst), 2);
            assert!(provider.is_empty());
        }

        #[test]
        fn loader_receives_callers_context() {
            let cache = AutoCache::new(
                Arc::new(MemoryCache::new()),
                Arc::new(|ctx: &Context, _key: &str| match ctx.err() {
                    Some(err) => Err(err),
                    None => Ok(Bytes::from_static(b"ok")),
                }),
            );
            let (ctx, cancel) = Context::background().with_cancel();
            cancel.cancel();
            assert!(matches!(
                cache.get(&ctx, "k"),
                Err(ImageDeliveryError::Cancelled)
            ));
        }
    }

    /// Cache whose loader blocks until released; counts loader calls.
    fn gated_cache(
        outcome: Result<Bytes>,
        provider: Arc<dyn CacheProvider>,
    ) -> (
        Arc<AutoCache>,
        crossbeam_channel::Sender<()>,
        Receiver<()>,
        Arc<AtomicUsize>,
    ) {
        let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
        let (entered_tx, entered_rx) = crossbeam_channel::unbounded::<()>();
        let loads = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&loads);
        let loader = move |_ctx: &Context, _key: &str| {
            counted.fetch_add(1, Ordering::SeqCst);
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
            outcome.clone()
        };
        let cache = Arc::new(AutoCache::new(provider, Arc::new(loader)));
        (cache, release_tx, entered_rx, loads)
    }

    /// One owner enters the loader, `callers - 1` others join before release.
    fn run_burst(
        cache: &Arc<AutoCache>,
        key: &'static str,
        callers: usize,
        release: &crossbeam_channel::Sender<()>,
        entered: &Receiver<()>,
    ) -> Vec<Result<Bytes>> {
        let owner = {
            let cache = Arc::clone(cache);
            thread::spawn(move || cache.get(&Context::background(), key))
        };
        entered.recv().unwrap();

        let joiners: Vec<_> = (1..callers)
            .map(|_| {
                let cache = Arc::clone(cache);
                thread::spawn(move || cache.get(&Context::background(), key))
            })
            .collect();
        wait_for_waiters(cache, key, callers - 1);
        release.send(()).unwrap();

        let mut results = vec![owner.join().unwrap()];
        results.extend(joiners.into_iter().map(|h| h.join().unwrap()));
        results
    }

    mod coalescing {
        use super::*;

        #[test]
        fn concurrent_misses_share_one_load() {
            let (cache, release, entered, loads) = gated_cache(
                Ok(Bytes::from_static(b"payload")),
                Arc::new(MemoryCache::new()),
            );
            let results = run_burst(&cache, "k", 8, &release, &entered);

            assert_eq!(loads.load(Ordering::SeqCst), 1);
            for result in results {
                assert_eq!(result.unwrap(), Bytes::from_static(b"payload"));
            }
            assert_eq!(cache.in_flight_len(), 0);
        }

        #[test]
        fn concurrent_misses_share_loader_error() {
            let (cache, release, entered, loads) = gated_cache(
                Err(ImageDeliveryError::loader("backend exploded")),
                Arc::new(MemoryCache::new()),
            );
            let results = run_burst(&cache, "k", 6, &release, &entered);

            assert_eq!(loads.load(Ordering::SeqCst), 1);
            for result in results {
                assert_eq!(result.unwrap_err().to_string(), "backend exploded");
            }
        }

        #[test]
        fn set_failure_reaches_every_waiter() {
            let (cache, release, entered, loads) =
                gated_cache(Ok(Bytes::from_static(b"fresh")), Arc::new(ScriptedProvider));
            let results = run_burst(&cache, "seterror", 5, &release, &entered);

            assert_eq!(loads.load(Ordering::SeqCst), 1);
            for result in results {
                assert_eq!(
                    result.unwrap_err().to_string(),
                    "cache provider error: seterror"
                );
            }
        }

        #[test]
        fn record_is_removed_after_settling() {
            let (cache, release, entered, loads) =
                gated_cache(Err(ImageDeliveryError::loader("nope")), Arc::new(MemoryCache::new()));

            run_burst(&cache, "k", 2, &release, &entered);
            assert_eq!(cache.in_flight_len(), 0);

            // A later miss starts a fresh load instead of reusing the settled record.
            release.send(()).unwrap();
            assert!(cache.get(&Context::background(), "k").is_err());
            entered.recv().unwrap();
            assert_eq!(loads.load(Ordering::SeqCst), 2);
        }

        #[test]
        fn cancelled_waiter_still_gets_owner_result() {
            let (cache, release, entered, loads) = gated_cache(
                Ok(Bytes::from_static(b"shared")),
                Arc::new(MemoryCache::new()),
            );
            let owner = {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&Context::background(), "k"))
            };
            entered.recv().unwrap();

            let (waiter_ctx, cancel) = Context::background().with_cancel();
            cancel.cancel();
            let waiter = {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&waiter_ctx, "k"))
            };
            wait_for_waiters(&cache, "k", 1);
            release.send(()).unwrap();

            assert_eq!(owner.join().unwrap().unwrap(), "shared");
            assert_eq!(waiter.join().unwrap().unwrap(), "shared");
            assert_eq!(loads.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn owner_cancellation_reaches_every_waiter() {
            let (entered_tx, entered_rx) = crossbeam_channel::unbounded::<()>();
            let provider = Arc::new(MemoryCache::new());
            let cache = Arc::new(AutoCache::new(
                provider.clone(),
                Arc::new(move |ctx: &Context, _key: &str| -> Result<Bytes> {
                    entered_tx.send(()).unwrap();
                    let _ = ctx.done().recv();
                    Err(ctx.err().unwrap_or(ImageDeliveryError::Cancelled))
                }),
            ));

            let (owner_ctx, cancel_owner) = Context::background().with_cancel();
            let owner = {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&owner_ctx, "k"))
            };
            entered_rx.recv().unwrap();

            let (live_ctx, _keep) = Context::background().with_cancel();
            let waiters: Vec<_> = (0..3)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let ctx = live_ctx.clone();
                    thread::spawn(move || cache.get(&ctx, "k"))
                })
                .collect();
            wait_for_waiters(&cache, "k", 3);
            cancel_owner.cancel();

            assert!(matches!(
                owner.join().unwrap(),
                Err(ImageDeliveryError::Cancelled)
            ));
            for waiter in waiters {
                assert!(matches!(
                    waiter.join().unwrap(),
                    Err(ImageDeliveryError::Cancelled)
                ));
            }
            assert!(!live_ctx.is_done());
            assert!(provider.is_empty());
            assert_eq!(cache.in_flight_len(), 0);
        }

        #[test]
        fn panicking_loader_releases_waiters() {
            let (entered_tx, entered_rx) = crossbeam_channel::unbounded::<()>();
            let (release_tx, release_rx) = crossbeam_channel::unbounded::<()>();
            let cache = Arc::new(AutoCache::new(
                Arc::new(MemoryCache::new()),
                Arc::new(move |_ctx: &Context, _key: &str| -> Result<Bytes> {
                    entered_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                    panic!("loader bug");
                }),
            ));

            let owner = {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&Context::background(), "k"))
            };
            entered_rx.recv().unwrap();
            let waiter = {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.get(&Context::background(), "k"))
            };
            wait_for_waiters(&cache, "k", 1);
            release_tx.send(()).unwrap();

            assert!(owner.join().is_err());
            let err = waiter.join().unwrap().unwrap_err();
            assert!(matches!(err, ImageDeliveryError::InternalPanic { .. }));
            assert_eq!(cache.in_flight_len(), 0);
        }

        #[test]
        fn distinct_keys_load_independently() {
            let loads = Arc::new(AtomicUsize::new(0));
            let counted = Arc::clone(&loads);
            let cache = Arc::new(AutoCache::new(
                Arc::new(MemoryCache::new()),
                Arc::new(move |_ctx: &Context, key: &str| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(Bytes::copy_from_slice(key.as_bytes()))
                }),
            ));

            thread::scope(|s| {
                for i in 0..4 {
                    let cache = Arc::clone(&cache);
                    s.spawn(move || {
                        let key = format!("key-{i}");
                        assert_eq!(
                            cache.get(&Context::background(), &key).unwrap(),
                            key.as_bytes()
                        );
                    });
                }
            });
            assert_eq!(loads.load(Ordering::SeqCst), 4);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 16,
                .. ProptestConfig::default()
            })]

            #[test]
            fn prop_m_callers_one_load(callers in 2usize..12, fail in any::<bool>()) {
                let outcome = if fail {
                    Err(ImageDeliveryError::loader("load failed"))
                } else {
                    Ok(Bytes::from_static(b"data"))
                };
                let (cache, release, entered, loads) =
                    gated_cache(outcome.clone(), Arc::new(MemoryCache::new()));
                let results = run_burst(&cache, "k", callers, &release, &entered);

                prop_assert_eq!(loads.load(Ordering::SeqCst), 1);
                prop_assert_eq!(results.len(), callers);
                for result in results {
                    match (&result, &outcome) {
                        (Ok(a), Ok(b)) => prop_assert_eq!(a, b),
                        (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
                        _ => prop_assert!(false, "mismatched outcome"),
                    }
                }
            }
        }
    }
}
