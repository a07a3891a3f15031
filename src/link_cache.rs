//! Pool of reply-sending links, keyed by destination address.
//!
//! Wraps [`Cache`] with an eviction hook fixed to "close the link" and a
//! factory that attaches a new sending link on cache miss. Entries are only
//! ever removed by TTL expiry; an address evicted once can be re-fetched,
//! which re-invokes the factory.
//!
//! Because eviction closes the underlying link, callers must re-fetch from
//! the pool for every send rather than holding a sender across time.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{BoxFuture, Cache, PurgeHook};
use crate::macros::{log_debug, log_warn};
use crate::{Address, Result, SenderPtr};

/// Capability token a peer advertises when one anonymous sending link can
/// deliver to arbitrary destinations, making this pool unnecessary.
pub const RELAY_CAPABILITY: &str = "ANONYMOUS-RELAY";

/// Default idle lifetime of a cached reply link.
pub const REPLY_LINK_TTL: Duration = Duration::from_millis(60_000);

/// Factory attaching a sending link toward the given address.
pub type SenderFactory = Arc<dyn Fn(Address) -> BoxFuture<'static, Result<SenderPtr>> + Send + Sync>;

/// Lazily-populated pool of per-destination sending links.
pub struct LinkCache {
    links: Cache<Address, SenderPtr>,
    factory: SenderFactory,
}

impl LinkCache {
    // ---
    /// Create a pool whose entries expire after `ttl` idle time; evicted
    /// links are closed.
    pub fn new(ttl: Duration, factory: SenderFactory) -> Self {
        // ---
        let purged: PurgeHook<Address, SenderPtr> = Arc::new(|_address, sender: SenderPtr| {
            Box::pin(async move {
                if let Err(_err) = sender.close().await {
                    log_warn!("failed to close expired reply link to {_address}: {_err}");
                }
            })
        });

        Self {
            links: Cache::new(ttl, purged),
            factory,
        }
    }

    /// Return the sending link for `address`, attaching one on miss.
    ///
    /// A hit refreshes the entry's idle timer, keeping the link alive.
    pub async fn get(&self, address: &Address) -> Result<SenderPtr> {
        // ---
        if let Some(sender) = self.links.get(address) {
            return Ok(sender);
        }

        log_debug!("link cache: attaching sender for {address}");
        let sender = (self.factory)(address.clone()).await?;
        self.links.put(address.clone(), sender.clone());
        Ok(sender)
    }

    /// Number of live cached links.
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}
