use std::{
    collections::{BTreeMap, HashSet},
    net::TcpListener,
    ops::RangeInclusive,
    sync::Mutex,
};

use crate::{MonoopsError, MonoopsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hands out TCP ports to projects and remembers who owns each one.
///
/// Allocation and release happen under one lock, so two projects can never be handed the same
/// port.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    owners: Mutex<BTreeMap<u16, String>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortAllocator {
    /// Creates an allocator scanning `range` for free ports.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            owners: Mutex::new(BTreeMap::new()),
        }
    }

    /// Allocates ports for `project_id`.
    ///
    /// Each requested port is kept if it is bindable and not owned by another project, otherwise it
    /// is replaced by the first free port in the range. With no requested ports, `count` ports are
    /// scanned for (at least one).
    pub fn allocate(
        &self,
        project_id: &str,
        requested: &[u16],
        count: usize,
    ) -> MonoopsResult<Vec<u16>> {
        let mut owners = self.lock()?;
        let mut chosen: Vec<u16> = Vec::new();

        let wanted = if requested.is_empty() {
            vec![None; count.max(1)]
        } else {
            requested.iter().copied().map(Some).collect()
        };

        for port in wanted {
            let honoured = port.filter(|p| {
                !chosen.contains(p)
                    && owners.get(p).map_or(true, |owner| owner == project_id)
                    && (owners.get(p).is_some() || is_port_free(*p))
            });

            let port = match honoured {
                Some(port) => port,
                None => {
                    if let Some(p) = port {
                        tracing::info!(project_id, port = p, "requested port unavailable, scanning");
                    }
                    self.scan(&owners, &chosen).ok_or_else(|| {
                        MonoopsError::PortUnavailable(format!(
                            "no free port in {}-{} for {}",
                            self.range.start(),
                            self.range.end(),
                            project_id
                        ))
                    })?
                }
            };
            chosen.push(port);
        }

        for port in &chosen {
            owners.insert(*port, project_id.to_string());
        }

        tracing::debug!(project_id, ports = ?chosen, "allocated ports");
        Ok(chosen)
    }

    /// Releases every port owned by `project_id` and returns them.
    pub fn release(&self, project_id: &str) -> Vec<u16> {
        let Ok(mut owners) = self.lock() else {
            return Vec::new();
        };

        let released: Vec<u16> = owners
            .iter()
            .filter(|(_, owner)| owner.as_str() == project_id)
            .map(|(port, _)| *port)
            .collect();
        for port in &released {
            owners.remove(port);
        }

        if !released.is_empty() {
            tracing::debug!(project_id, ports = ?released, "released ports");
        }
        released
    }

    /// Records ports for a project without probing them, e.g. when re-adopting a running process.
    pub fn reserve(&self, project_id: &str, ports: &[u16]) {
        if let Ok(mut owners) = self.lock() {
            for port in ports {
                owners.entry(*port).or_insert_with(|| project_id.to_string());
            }
        }
    }

    /// Returns the project owning `port`.
    pub fn owner(&self, port: u16) -> Option<String> {
        self.lock().ok()?.get(&port).cloned()
    }

    /// Returns the ports owned by `project_id`, ascending.
    pub fn ports_of(&self, project_id: &str) -> Vec<u16> {
        self.lock()
            .map(|owners| {
                owners
                    .iter()
                    .filter(|(_, owner)| owner.as_str() == project_id)
                    .map(|(port, _)| *port)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the whole port-to-project map.
    pub fn snapshot(&self) -> BTreeMap<u16, String> {
        self.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn scan(&self, owners: &BTreeMap<u16, String>, chosen: &[u16]) -> Option<u16> {
        let chosen: HashSet<u16> = chosen.iter().copied().collect();
        self.range
            .clone()
            .find(|p| !owners.contains_key(p) && !chosen.contains(p) && is_port_free(*p))
    }

    fn lock(&self) -> MonoopsResult<std::sync::MutexGuard<'_, BTreeMap<u16, String>>> {
        self.owners
            .lock()
            .map_err(|_| MonoopsError::custom(anyhow::anyhow!("port allocator lock poisoned")))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Whether a TCP listener can currently bind `port` on all interfaces.
pub fn is_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn free_port() -> u16 {
        TcpListener::bind(("0.0.0.0", 0))
            .and_then(|l| l.local_addr())
            .map(|a| a.port())
            .expect("ephemeral port")
    }

    #[test]
    fn test_requested_port_is_honoured_once() -> anyhow::Result<()> {
        let port = free_port();
        let allocator = PortAllocator::new(port.saturating_sub(50)..=port.saturating_add(50));

        assert_eq!(allocator.allocate("a", &[port], 1)?, vec![port]);

        let b = allocator.allocate("b", &[port], 1)?;
        assert_eq!(b.len(), 1);
        assert_ne!(b[0], port);
        assert_eq!(allocator.owner(port).as_deref(), Some("a"));
        assert_eq!(allocator.owner(b[0]).as_deref(), Some("b"));
        Ok(())
    }

    #[test]
    fn test_release_only_touches_owner() -> anyhow::Result<()> {
        let port = free_port();
        let allocator = PortAllocator::new(port.saturating_sub(50)..=port.saturating_add(50));

        let a = allocator.allocate("a", &[], 2)?;
        let b = allocator.allocate("b", &[], 1)?;
        assert_eq!(a.len(), 2);

        let mut released = allocator.release("a");
        released.sort_unstable();
        let mut expected = a.clone();
        expected.sort_unstable();
        assert_eq!(released, expected);
        assert_eq!(allocator.ports_of("b"), b);
        assert!(allocator.ports_of("a").is_empty());
        Ok(())
    }

    #[test]
    fn test_bound_port_is_skipped() -> anyhow::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", 0))?;
        let busy = listener.local_addr()?.port();
        let allocator = PortAllocator::new(busy..=busy.saturating_add(20));

        let ports = allocator.allocate("a", &[busy], 1)?;
        assert_ne!(ports[0], busy);
        Ok(())
    }

    #[test]
    fn test_exhausted_range_is_a_conflict() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let busy = listener.local_addr().expect("addr").port();
        let allocator = PortAllocator::new(busy..=busy);

        let err = allocator.allocate("a", &[], 1).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Conflict);
    }
}
