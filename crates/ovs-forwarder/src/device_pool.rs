//! Pool of SR-IOV devices available to cross-connects.
//!
//! The pool is fixed at startup. A device is handed out at most once at a
//! time, and every allocation made on behalf of a connection is recorded
//! under its (connection id, role) so teardown can find it again.

use std::collections::{BTreeMap, HashMap};

use nsm_fwd_common::{FwdError, FwdResult};
use tracing::{debug, info};

use crate::types::Role;

/// Owner of a device allocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationKey {
    pub conn_id: String,
    pub role: Role,
}

impl AllocationKey {
    pub fn new(conn_id: &str, role: Role) -> Self {
        Self {
            conn_id: conn_id.to_string(),
            role,
        }
    }
}

/// A device handed out together with its switch-side representor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub device: String,
    pub representor: String,
}

/// Free/in-use state of every known device plus the allocation records.
#[derive(Debug, Default)]
pub struct DevicePool {
    devices: BTreeMap<String, bool>,
    records: HashMap<AllocationKey, String>,
}

impl DevicePool {
    /// Creates a pool over `devices`, all free.
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            devices: devices.into_iter().map(|d| (d.into(), false)).collect(),
            records: HashMap::new(),
        }
    }

    /// Number of devices in the pool.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Number of devices currently handed out.
    pub fn in_use_count(&self) -> usize {
        self.devices.values().filter(|used| **used).count()
    }

    /// In-use state of a device, `None` if it is not part of the pool.
    pub fn is_in_use(&self, device: &str) -> Option<bool> {
        self.devices.get(device).copied()
    }

    /// Picks the first candidate that is free and has a usable representor.
    ///
    /// `resolve` returns the representor of a device, or `None` when it
    /// cannot be resolved or is already attached to the switch. Candidates
    /// outside the pool are skipped.
    pub fn allocate<F>(&mut self, candidates: &[String], mut resolve: F) -> FwdResult<Allocation>
    where
        F: FnMut(&str) -> Option<String>,
    {
        for candidate in candidates {
            match self.devices.get(candidate.as_str()) {
                None => {
                    debug!(device = %candidate, "Candidate is not in the pool");
                    continue;
                }
                Some(true) => {
                    debug!(device = %candidate, "Candidate is in use");
                    continue;
                }
                Some(false) => {}
            }
            let Some(representor) = resolve(candidate) else {
                debug!(device = %candidate, "Candidate has no usable representor");
                continue;
            };
            self.devices.insert(candidate.clone(), true);
            info!(device = %candidate, representor = %representor, "Allocated device");
            return Ok(Allocation {
                device: candidate.clone(),
                representor,
            });
        }
        Err(FwdError::no_device_available(candidates))
    }

    /// Marks a device free. Unknown or already free devices are ignored.
    pub fn release(&mut self, device: &str) {
        if let Some(used) = self.devices.get_mut(device) {
            if *used {
                info!(device, "Released device");
            }
            *used = false;
        }
    }

    /// Allocates a device and records it for `key`.
    ///
    /// A stale record left by an earlier failed connect is released first.
    pub fn allocate_for<F>(
        &mut self,
        key: AllocationKey,
        candidates: &[String],
        resolve: F,
    ) -> FwdResult<Allocation>
    where
        F: FnMut(&str) -> Option<String>,
    {
        if let Some(stale) = self.records.remove(&key) {
            debug!(conn_id = %key.conn_id, role = %key.role, device = %stale, "Dropping stale allocation");
            self.release(&stale);
        }
        let allocation = self.allocate(candidates, resolve)?;
        self.records.insert(key, allocation.device.clone());
        Ok(allocation)
    }

    /// Removes the record for `key` and frees its device.
    pub fn release_for(&mut self, key: &AllocationKey) -> Option<String> {
        let device = self.records.remove(key)?;
        self.release(&device);
        Some(device)
    }

    /// Device recorded for `key`.
    pub fn record(&self, key: &AllocationKey) -> Option<&str> {
        self.records.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn devices(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("0000:01:00.{}", i)).collect()
    }

    fn rep(device: &str) -> Option<String> {
        device.rsplit('.').next().map(|i| format!("rep{}", i))
    }

    #[test]
    fn test_pool_is_bounded() {
        let all = devices(3);
        let mut pool = DevicePool::new(all.clone());
        for _ in 0..3 {
            pool.allocate(&all, rep).unwrap();
        }
        assert_eq!(pool.in_use_count(), 3);
        assert!(matches!(
            pool.allocate(&all, rep),
            Err(FwdError::NoDeviceAvailable { .. })
        ));
    }

    #[test]
    fn test_release_is_idempotent() {
        let all = devices(1);
        let mut pool = DevicePool::new(all.clone());
        let a = pool.allocate(&all, rep).unwrap();
        pool.release(&a.device);
        pool.release(&a.device);
        pool.release("0000:99:00.0");
        assert_eq!(pool.is_in_use(&a.device), Some(false));
        assert_eq!(pool.is_in_use("0000:99:00.0"), None);
        assert!(pool.allocate(&all, rep).is_ok());
    }

    #[test]
    fn test_scan_skips_in_use_and_unresolvable() {
        let all = devices(3);
        let mut pool = DevicePool::new(all.clone());
        pool.allocate(&all[..1], rep).unwrap();

        // First is in use, second has no representor.
        let a = pool
            .allocate(&all, |d| if d.ends_with(".2") { None } else { rep(d) })
            .unwrap();
        assert_eq!(a.device, "0000:01:00.3");
        assert_eq!(a.representor, "rep3");
    }

    #[test]
    fn test_candidates_outside_pool_are_skipped() {
        let mut pool = DevicePool::new(devices(1));
        let err = pool
            .allocate(&["0000:05:00.1".to_string()], rep)
            .unwrap_err();
        assert!(matches!(err, FwdError::NoDeviceAvailable { .. }));
    }

    #[test]
    fn test_records() {
        let all = devices(2);
        let mut pool = DevicePool::new(all.clone());
        let src = AllocationKey::new("7", Role::Source);
        let dst = AllocationKey::new("7", Role::Destination);

        pool.allocate_for(src.clone(), &all, rep).unwrap();
        pool.allocate_for(dst.clone(), &all, rep).unwrap();
        assert_eq!(pool.record(&src), Some("0000:01:00.1"));
        assert_eq!(pool.record(&dst), Some("0000:01:00.2"));

        assert_eq!(pool.release_for(&src).as_deref(), Some("0000:01:00.1"));
        assert_eq!(pool.release_for(&src), None);
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.record(&dst), Some("0000:01:00.2"));
    }

    #[test]
    fn test_stale_record_is_replaced() {
        let all = devices(1);
        let mut pool = DevicePool::new(all.clone());
        let key = AllocationKey::new("1", Role::Remote);
        pool.allocate_for(key.clone(), &all, rep).unwrap();
        pool.allocate_for(key.clone(), &all, rep).unwrap();
        assert_eq!(pool.in_use_count(), 1);
        assert_eq!(pool.record(&key), Some("0000:01:00.1"));
    }

    #[tokio::test]
    async fn test_concurrent_allocations_never_exceed_pool() {
        let all = devices(4);
        let pool = Arc::new(Mutex::new(DevicePool::new(all.clone())));

        let mut tasks = Vec::new();
        for i in 0..10 {
            let pool = Arc::clone(&pool);
            let all = all.clone();
            tasks.push(tokio::spawn(async move {
                let key = AllocationKey::new(&i.to_string(), Role::Source);
                pool.lock().await.allocate_for(key, &all, rep)
            }));
        }

        let mut granted = Vec::new();
        for task in tasks {
            if let Ok(a) = task.await.unwrap() {
                granted.push(a.device);
            }
        }
        granted.sort();
        granted.dedup();
        assert_eq!(granted.len(), 4);
        assert_eq!(pool.lock().await.in_use_count(), 4);
    }
}
