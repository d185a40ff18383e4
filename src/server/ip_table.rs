//! Per-source-IP connection admission tracking.
//!
//! Sits alongside [`crate::ConnectionFilter`] in the admission path: the
//! filter trait is for caller-defined policy, this table is the built-in
//! "too many connections from one address" guard. Unlike [`crate::http::types::HeaderMap`],
//! which stays a small `Vec` because its key space is a handful of known
//! header names, an IP address space is unbounded, so a real `HashMap` is
//! the right structure here.

use std::{collections::HashMap, net::IpAddr, sync::Mutex};

pub(crate) struct IpTable {
    counts: Mutex<HashMap<IpAddr, usize>>,
}

impl IpTable {
    pub(crate) fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Attempts to admit a new connection from `addr`. Returns `false`
    /// (and does not record the attempt) if `addr` is already at `max`.
    pub(crate) fn try_admit(&self, addr: IpAddr, max: usize) -> bool {
        if max == 0 {
            return true;
        }

        let mut counts = self.counts.lock().expect("ip table mutex poisoned");
        let count = counts.entry(addr).or_insert(0);
        if *count >= max {
            return false;
        }

        *count += 1;
        true
    }

    /// Releases a previously admitted connection's slot.
    pub(crate) fn release(&self, addr: IpAddr) {
        let mut counts = self.counts.lock().expect("ip table mutex poisoned");
        if let Some(count) = counts.get_mut(&addr) {
            *count -= 1;
            if *count == 0 {
                counts.remove(&addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    #[test]
    fn admits_up_to_max_then_rejects() {
        let table = IpTable::new();
        assert!(table.try_admit(ip(), 2));
        assert!(table.try_admit(ip(), 2));
        assert!(!table.try_admit(ip(), 2));
    }

    #[test]
    fn release_frees_a_slot() {
        let table = IpTable::new();
        assert!(table.try_admit(ip(), 1));
        assert!(!table.try_admit(ip(), 1));

        table.release(ip());
        assert!(table.try_admit(ip(), 1));
    }

    #[test]
    fn zero_max_disables_check() {
        let table = IpTable::new();
        for _ in 0..100 {
            assert!(table.try_admit(ip(), 0));
        }
    }
}
