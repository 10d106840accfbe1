//! Network lease pool.
//!
//! A finite set of subnet descriptors handed to lab instances that need
//! network identities. In the default (shared) mode a checkout never marks
//! the lease used, so independent resolutions can receive the same subnet.
//! Exclusive mode marks leases on checkout and records the holder (one
//! student lab instance); the holder gets the same lease back on every later
//! checkout until it releases it.

use crate::config::types::{LabError, LeaseSpec, Result};
use crate::observability::audit::events;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Mutex;

/// One entry of the pool
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkLease {
    pub subnet_base: Ipv4Addr,
    pub mask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,
}

impl NetworkLease {
    pub fn new(subnet_base: Ipv4Addr, mask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            subnet_base,
            mask,
            gateway,
            used: false,
            holder: None,
        }
    }

    /// Address `index` positions after the subnet base
    pub fn offset(&self, index: u32) -> Result<Ipv4Addr> {
        let base = u32::from(self.subnet_base);
        base.checked_add(index)
            .map(Ipv4Addr::from)
            .ok_or_else(|| {
                LabError::Config(format!(
                    "subnet offset {} overflows base {}",
                    index, self.subnet_base
                ))
            })
    }

    fn parse(spec: &LeaseSpec) -> Result<Self> {
        let parse = |field: &str, value: &str| -> Result<Ipv4Addr> {
            value.parse::<Ipv4Addr>().map_err(|_| {
                LabError::Config(format!("lease {} '{}' is not an IPv4 address", field, value))
            })
        };
        Ok(Self::new(
            parse("subnet", &spec.subnet)?,
            parse("mask", &spec.mask)?,
            parse("gateway", &spec.gateway)?,
        ))
    }
}

/// Shared pool of network leases
pub struct LeasePool {
    leases: Mutex<Vec<NetworkLease>>,
    exclusive: bool,
}

impl LeasePool {
    pub fn new(leases: Vec<NetworkLease>, exclusive: bool) -> Self {
        Self {
            leases: Mutex::new(leases),
            exclusive,
        }
    }

    /// Build a pool from configured specs; an empty list yields the default pool
    pub fn from_specs(specs: &[LeaseSpec], exclusive: bool) -> Result<Self> {
        if specs.is_empty() {
            return Ok(Self::new(default_leases(), exclusive));
        }
        let leases = specs
            .iter()
            .map(NetworkLease::parse)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(leases, exclusive))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<NetworkLease>>> {
        self.leases
            .lock()
            .map_err(|_| LabError::ResourceExhausted("lease pool lock poisoned".to_string()))
    }

    /// Lease for `holder`.
    ///
    /// Exclusive mode hands back the lease `holder` already has, otherwise the
    /// first unused one, marked as held. Shared mode returns the first lease.
    pub fn checkout(&self, holder: &str) -> Result<NetworkLease> {
        let mut leases = self.lock()?;

        if self.exclusive {
            if let Some(held) = leases
                .iter()
                .find(|lease| lease.holder.as_deref() == Some(holder))
            {
                return Ok(held.clone());
            }
        }

        let lease = leases.iter_mut().find(|lease| !lease.used).ok_or_else(|| {
            LabError::ResourceExhausted("no network lease available".to_string())
        })?;

        if self.exclusive {
            lease.used = true;
            lease.holder = Some(holder.to_string());
        }
        let granted = lease.clone();
        drop(leases);

        events::lease_checkout(granted.subnet_base.to_string(), self.exclusive);
        Ok(granted)
    }

    /// Leases currently held by `holder`
    pub fn held_by(&self, holder: &str) -> Vec<NetworkLease> {
        self.leases
            .lock()
            .map(|leases| {
                leases
                    .iter()
                    .filter(|lease| lease.holder.as_deref() == Some(holder))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Return every lease held by `holder`. No-op in shared mode.
    pub fn release(&self, holder: &str) -> usize {
        let released = self.release_if(|held| held == holder);
        if released > 0 {
            events::lease_released(holder, released);
        }
        released
    }

    /// Return every lease whose holder starts with `prefix`
    pub fn release_prefix(&self, prefix: &str) -> usize {
        let released = self.release_if(|held| held.starts_with(prefix));
        if released > 0 {
            events::lease_released(&format!("{}*", prefix), released);
        }
        released
    }

    fn release_if<F: Fn(&str) -> bool>(&self, matches: F) -> usize {
        let Ok(mut leases) = self.leases.lock() else {
            return 0;
        };
        let mut released = 0;
        for lease in leases.iter_mut() {
            if lease.holder.as_deref().is_some_and(&matches) {
                lease.used = false;
                lease.holder = None;
                released += 1;
            }
        }
        released
    }

    pub fn available(&self) -> usize {
        self.leases
            .lock()
            .map(|leases| leases.iter().filter(|lease| !lease.used).count())
            .unwrap_or(0)
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

/// Sixteen /24 subnets, 172.20.0.0 through 172.20.15.0, gateway at .1
fn default_leases() -> Vec<NetworkLease> {
    (0u8..16)
        .map(|n| {
            NetworkLease::new(
                Ipv4Addr::new(172, 20, n, 0),
                Ipv4Addr::new(255, 255, 255, 0),
                Ipv4Addr::new(172, 20, n, 1),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(subnet: &str) -> LeaseSpec {
        LeaseSpec {
            subnet: subnet.to_string(),
            mask: "255.255.255.0".to_string(),
            gateway: "10.0.0.1".to_string(),
        }
    }

    #[test]
    fn shared_checkout_returns_same_lease_repeatedly() {
        let pool = LeasePool::from_specs(&[spec("10.0.0.0"), spec("10.0.1.0")], false).unwrap();
        let first = pool.checkout("stu_a_00000000-web").unwrap();
        let second = pool.checkout("stu_b_00000000-web").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.holder, None);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.release("stu_a_00000000-web"), 0);
    }

    #[test]
    fn exclusive_checkout_exhausts_pool() {
        let pool = LeasePool::from_specs(&[spec("10.0.0.0")], true).unwrap();
        let lease = pool.checkout("stu_a_00000000-web").unwrap();
        assert!(lease.used);
        assert_eq!(lease.holder.as_deref(), Some("stu_a_00000000-web"));
        let err = pool.checkout("stu_b_00000000-web").unwrap_err();
        assert!(matches!(err, LabError::ResourceExhausted(_)));

        assert_eq!(pool.release("stu_a_00000000-web"), 1);
        assert!(pool.checkout("stu_b_00000000-web").is_ok());
    }

    #[test]
    fn exclusive_holder_gets_its_lease_back() {
        let pool = LeasePool::from_specs(&[spec("10.0.0.0"), spec("10.0.1.0")], true).unwrap();
        let first = pool.checkout("stu_a_00000000-web").unwrap();
        let again = pool.checkout("stu_a_00000000-web").unwrap();
        assert_eq!(first, again);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.held_by("stu_a_00000000-web"), vec![first]);

        let other = pool.checkout("stu_b_00000000-web").unwrap();
        assert_ne!(other.subnet_base, again.subnet_base);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn release_prefix_frees_every_lab_of_a_principal() {
        let pool = LeasePool::from_specs(
            &[spec("10.0.0.0"), spec("10.0.1.0"), spec("10.0.2.0")],
            true,
        )
        .unwrap();
        pool.checkout("stu_a_00000000-web").unwrap();
        pool.checkout("stu_a_00000000-dns").unwrap();
        pool.checkout("stu_ab_00000000-web").unwrap();

        assert_eq!(pool.release_prefix("stu_a_00000000-"), 2);
        assert_eq!(pool.available(), 2);
        assert_eq!(pool.held_by("stu_ab_00000000-web").len(), 1);
    }

    #[test]
    fn empty_pool_is_hard_failure() {
        let pool = LeasePool::new(Vec::new(), false);
        assert!(matches!(pool.checkout("x"), Err(LabError::ResourceExhausted(_))));
    }

    #[test]
    fn default_pool_has_sixteen_subnets() {
        let pool = LeasePool::from_specs(&[], false).unwrap();
        assert_eq!(pool.available(), 16);
        let lease = pool.checkout("x").unwrap();
        assert_eq!(lease.gateway, Ipv4Addr::new(172, 20, 0, 1));
    }

    #[test]
    fn offset_adds_to_base() {
        let lease = NetworkLease::parse(&spec("10.0.1.0")).unwrap();
        assert_eq!(lease.offset(5).unwrap(), Ipv4Addr::new(10, 0, 1, 5));
        assert_eq!(lease.offset(256).unwrap(), Ipv4Addr::new(10, 0, 2, 0));
    }
}
