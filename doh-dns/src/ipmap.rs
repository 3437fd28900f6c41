//! Per-hostname cache of resolver addresses with a confirmed favourite
//!
//! Each DoH hostname maps to an [`IpSet`]: every address it has resolved to,
//! plus at most one address that most recently served a query successfully.
//! Dispatchers try the confirmed address first and fall back to the rest in
//! random order.
//!
//! The map itself only guards get-or-create. Every set carries its own lock,
//! so work on one hostname never blocks another.

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard, Once, PoisonError, RwLock};

use rand::seq::SliceRandom;

use crate::error::Error;

/// System-level hostname resolution
pub trait HostResolver: Send + Sync {
    /// Resolve `hostname` to every address the system knows for it
    fn resolve(&self, hostname: &str) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, hostname: &str) -> std::io::Result<Vec<IpAddr>> {
        Ok((hostname, 0)
            .to_socket_addrs()?
            .map(|addr| addr.ip())
            .collect())
    }
}

#[derive(Debug, Default)]
struct AddressState {
    addrs: Vec<IpAddr>,
    confirmed: Option<IpAddr>,
}

/// Addresses known for one hostname
///
/// Invariant: the confirmed address, when set, is also in the address list.
pub struct IpSet {
    hostname: String,
    resolver: Arc<dyn HostResolver>,
    seeded: Once,
    state: Mutex<AddressState>,
}

impl IpSet {
    fn new(hostname: &str, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            hostname: hostname.to_string(),
            resolver,
            seeded: Once::new(),
            state: Mutex::new(AddressState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AddressState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run the initial lookup of the set's own hostname, once
    fn seed(&self) {
        self.seeded.call_once(|| {
            let added = self.add(&self.hostname);
            log::debug!("Seeded {} with {} address(es)", self.hostname, added);
        });
    }

    /// Like [`seed`](Self::seed), but the lookup runs on its own thread
    fn seed_in_background(self: &Arc<Self>) {
        self.seeded.call_once(|| {
            let set = self.clone();
            let spawned = std::thread::Builder::new()
                .name("ipmap-seed".into())
                .spawn(move || {
                    let added = set.add(&set.hostname);
                    log::debug!("Seeded {} with {} address(es)", set.hostname, added);
                });
            if let Err(e) = spawned {
                log::warn!("Cannot start lookup of {}: {}", self.hostname, e);
            }
        });
    }

    /// Hostname this set belongs to
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Add an IP literal, or every address `host` resolves to.
    ///
    /// Returns how many addresses were new. Lookup failures are logged and
    /// leave the set untouched.
    pub fn add(&self, host: &str) -> usize {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        let resolved = match literal.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => match self.resolver.resolve(host) {
                Ok(addrs) => addrs,
                Err(e) => {
                    let err = Error::Resolution {
                        host: host.to_string(),
                        reason: e.to_string(),
                    };
                    log::warn!("{}", err);
                    return 0;
                }
            },
        };
        self.insert(resolved)
    }

    /// Add addresses that are already known, without any lookup
    pub fn add_addrs(&self, addrs: &[IpAddr]) -> usize {
        self.insert(addrs.iter().copied())
    }

    fn insert(&self, addrs: impl IntoIterator<Item = IpAddr>) -> usize {
        let mut state = self.lock();
        let mut added = 0;
        for ip in addrs {
            if !state.addrs.contains(&ip) {
                state.addrs.push(ip);
                added += 1;
            }
        }
        added
    }

    /// Every known address, in a fresh random order on each call
    pub fn get_all(&self) -> Vec<IpAddr> {
        let mut addrs = self.lock().addrs.clone();
        addrs.shuffle(&mut rand::rng());
        addrs
    }

    /// Confirmed address first, then the remaining addresses shuffled
    pub fn candidates(&self) -> Vec<IpAddr> {
        let (confirmed, mut rest) = {
            let state = self.lock();
            let rest: Vec<IpAddr> = state
                .addrs
                .iter()
                .copied()
                .filter(|ip| Some(*ip) != state.confirmed)
                .collect();
            (state.confirmed, rest)
        };
        rest.shuffle(&mut rand::rng());

        let mut ordered = Vec::with_capacity(rest.len() + 1);
        ordered.extend(confirmed);
        ordered.append(&mut rest);
        ordered
    }

    /// Mark `ip` as the working address, adding it if it was unknown
    pub fn confirm(&self, ip: IpAddr) {
        let mut state = self.lock();
        if state.confirmed == Some(ip) {
            return;
        }
        if !state.addrs.contains(&ip) {
            state.addrs.push(ip);
        }
        state.confirmed = Some(ip);
        log::debug!("Confirmed {} for {}", ip, self.hostname);
    }

    /// Clear the confirmation, but only if `ip` is the confirmed address
    pub fn disconfirm(&self, ip: IpAddr) {
        let mut state = self.lock();
        if state.confirmed == Some(ip) {
            state.confirmed = None;
            log::debug!("Disconfirmed {} for {}", ip, self.hostname);
        }
    }

    /// The current confirmed address
    pub fn confirmed(&self) -> Option<IpAddr> {
        self.lock().confirmed
    }

    /// Number of known addresses
    pub fn len(&self) -> usize {
        self.lock().addrs.len()
    }

    /// True if no address is known
    pub fn is_empty(&self) -> bool {
        self.lock().addrs.is_empty()
    }
}

impl std::fmt::Debug for IpSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("IpSet")
            .field("hostname", &self.hostname)
            .field("addrs", &state.addrs)
            .field("confirmed", &state.confirmed)
            .finish()
    }
}

/// Hostname to [`IpSet`] map, shared by every dispatch of a tunnel
pub struct IpMap {
    resolver: Arc<dyn HostResolver>,
    sets: RwLock<HashMap<String, Arc<IpSet>>>,
}

impl IpMap {
    /// Create a map that seeds new sets through the system resolver
    pub fn new() -> Self {
        Self::with_resolver(Arc::new(SystemResolver))
    }

    /// Create a map with a custom resolver
    pub fn with_resolver(resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            resolver,
            sets: RwLock::new(HashMap::new()),
        }
    }

    /// Get the set for `hostname`, creating and seeding it on first use.
    ///
    /// Concurrent first lookups of the same hostname all receive the same
    /// set and wait for a single seeding lookup. This may block on system
    /// DNS; async callers should run it on a blocking thread.
    pub fn get(&self, hostname: &str) -> Arc<IpSet> {
        let set = self.entry(hostname);

        // Seeding happens outside the map lock
        set.seed();
        set
    }

    /// Get the set for `hostname`, adding `seed` addresses first.
    ///
    /// With a non-empty seed this never waits on system DNS: the lookup of a
    /// new hostname runs on a background thread and its addresses join the
    /// set when it finishes. With an empty seed it behaves like
    /// [`get`](Self::get).
    pub fn get_with_seed(&self, hostname: &str, seed: &[IpAddr]) -> Arc<IpSet> {
        if seed.is_empty() {
            return self.get(hostname);
        }

        let set = self.entry(hostname);
        set.add_addrs(seed);
        set.seed_in_background();
        set
    }

    fn entry(&self, hostname: &str) -> Arc<IpSet> {
        let existing = self
            .sets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .cloned();

        match existing {
            Some(set) => set,
            None => self
                .sets
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(hostname.to_string())
                .or_insert_with(|| Arc::new(IpSet::new(hostname, self.resolver.clone())))
                .clone(),
        }
    }

    /// Number of hostnames seen so far
    pub fn len(&self) -> usize {
        self.sets.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True if no hostname has been looked up yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IpMap {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IpMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpMap").field("hostnames", &self.len()).finish()
    }
}
