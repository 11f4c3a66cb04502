use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::PoolError;

#[derive(Debug, Clone, Copy)]
struct Slot {
    endpoint: SocketAddr,
    leased: bool,
}

/// Fixed set of session endpoints handed out first-fit.
#[derive(Debug)]
pub struct SessionPool {
    slots: Mutex<Vec<Slot>>,
}

impl SessionPool {
    pub fn new(endpoints: impl IntoIterator<Item = SocketAddr>) -> Self {
        let slots = endpoints
            .into_iter()
            .map(|endpoint| Slot {
                endpoint,
                leased: false,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
        }
    }

    /// Mark the lowest free endpoint as leased and return it.
    pub fn lease(&self) -> Result<SocketAddr, PoolError> {
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|slot| !slot.leased)
            .ok_or(PoolError::Exhausted)?;
        slot.leased = true;
        debug!(endpoint = %slot.endpoint, "leased session endpoint");
        Ok(slot.endpoint)
    }

    /// Return `endpoint` to the pool. Freeing a free or unknown endpoint does nothing.
    pub fn free(&self, endpoint: SocketAddr) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots
            .iter_mut()
            .find(|slot| slot.endpoint == endpoint && slot.leased)
        {
            slot.leased = false;
            debug!(%endpoint, "freed session endpoint");
        }
    }

    /// Like [`SessionPool::lease`], but the endpoint goes back when the guard drops.
    pub fn lease_guard(self: &Arc<Self>) -> Result<Lease, PoolError> {
        let endpoint = self.lease()?;
        Ok(Lease {
            pool: Arc::clone(self),
            endpoint,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn available(&self) -> usize {
        self.slots.lock().iter().filter(|slot| !slot.leased).count()
    }
}

impl fmt::Display for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        for (i, slot) in slots.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}", slot.endpoint)?;
            if slot.leased {
                f.write_str("*")?;
            }
        }
        Ok(())
    }
}

/// A leased endpoint, freed on drop.
#[derive(Debug)]
pub struct Lease {
    pool: Arc<SessionPool>,
    endpoint: SocketAddr,
}

impl Lease {
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.free(self.endpoint);
    }
}
