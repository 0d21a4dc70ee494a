use std::{collections::HashMap, fmt, net::IpAddr};

use super::cookie::Index;
use super::phase1::Phase1;
use super::phase2::Phase2;
use super::policy::{IpsecProtocol, TrafficSelectors};

/// Handle of a phase 1 SA; stays the same when the responder cookie becomes known.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Phase1Id(u64);

impl Phase1Id {
    #[cfg(test)]
    pub fn from_raw(value: u64) -> Phase1Id {
        Phase1Id(value)
    }
}

impl fmt::Display for Phase1Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ph1#{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct Phase2Id(u64);

impl fmt::Display for Phase2Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ph2#{}", self.0)
    }
}

/// Live phase 1 and phase 2 negotiations.
/// Phase 2 entries refer to their parent by handle, and must look it up again before use.
#[derive(Default)]
pub struct Registry {
    phase1: HashMap<Phase1Id, Phase1>,
    phase2: HashMap<Phase2Id, Phase2>,
    next_id: u64,
}

impl Registry {
    pub fn new() -> Registry {
        Registry::default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn insert_phase1(&mut self, phase1: Phase1) -> Phase1Id {
        let id = Phase1Id(self.next_id());
        self.phase1.insert(id, phase1);
        id
    }

    pub fn phase1(&self, id: Phase1Id) -> Option<&Phase1> {
        self.phase1.get(&id)
    }

    pub fn phase1_mut(&mut self, id: Phase1Id) -> Option<&mut Phase1> {
        self.phase1.get_mut(&id)
    }

    pub fn remove_phase1(&mut self, id: Phase1Id) -> Option<Phase1> {
        self.phase1.remove(&id)
    }

    /// Handles in creation order.
    pub fn phase1_ids(&self) -> Vec<Phase1Id> {
        let mut ids = self.phase1.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn phase1_count(&self) -> usize {
        self.phase1.len()
    }

    pub fn find_phase1(&self, index: &Index) -> Option<Phase1Id> {
        self.phase1
            .iter()
            .find(|(_, phase1)| phase1.index() == *index)
            .map(|(id, _)| *id)
    }

    pub fn find_phase1_by_initiator_cookie(&self, initiator_cookie: u64) -> Option<Phase1Id> {
        self.phase1
            .iter()
            .find(|(_, phase1)| phase1.index().initiator_cookie == initiator_cookie)
            .map(|(id, _)| *id)
    }

    /// Finds a negotiation that's still waiting for the responder cookie.
    pub fn find_phase1_awaiting_responder(&self, initiator_cookie: u64) -> Option<Phase1Id> {
        self.phase1
            .iter()
            .find(|(_, phase1)| {
                let index = phase1.index();
                index.initiator_cookie == initiator_cookie && !index.has_responder_cookie()
            })
            .map(|(id, _)| *id)
    }

    /// Newest established phase 1 SA with a peer.
    pub fn established_phase1_for(&self, remote: IpAddr) -> Option<Phase1Id> {
        self.phase1
            .iter()
            .filter(|(_, phase1)| phase1.remote_addr().ip() == remote && phase1.is_established())
            .max_by_key(|(id, phase1)| (phase1.created(), **id))
            .map(|(id, _)| *id)
    }

    /// Any phase 1 SA with a peer that hasn't expired yet, established or not.
    pub fn active_phase1_for(&self, remote: IpAddr) -> Option<Phase1Id> {
        self.established_phase1_for(remote).or_else(|| {
            self.phase1
                .iter()
                .filter(|(_, phase1)| phase1.remote_addr().ip() == remote && !phase1.is_expired())
                .map(|(id, _)| *id)
                .min()
        })
    }

    pub fn phase1_for_peer(&self, remote: IpAddr) -> Vec<Phase1Id> {
        let mut ids = self
            .phase1
            .iter()
            .filter(|(_, phase1)| phase1.remote_addr().ip() == remote)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn insert_phase2(&mut self, phase2: Phase2) -> Phase2Id {
        let id = Phase2Id(self.next_id());
        self.phase2.insert(id, phase2);
        id
    }

    pub fn phase2(&self, id: Phase2Id) -> Option<&Phase2> {
        self.phase2.get(&id)
    }

    pub fn phase2_mut(&mut self, id: Phase2Id) -> Option<&mut Phase2> {
        self.phase2.get_mut(&id)
    }

    pub fn remove_phase2(&mut self, id: Phase2Id) -> Option<Phase2> {
        self.phase2.remove(&id)
    }

    pub fn phase2_ids(&self) -> Vec<Phase2Id> {
        let mut ids = self.phase2.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn phase2_count(&self) -> usize {
        self.phase2.len()
    }

    /// Borrows a phase 2 negotiation together with its parent.
    pub fn phase2_with_parent_mut(&mut self, id: Phase2Id) -> Option<(&Phase1, &mut Phase2)> {
        let phase2 = self.phase2.get_mut(&id)?;
        let parent = self.phase1.get(&phase2.parent()?)?;
        Some((parent, phase2))
    }

    pub fn find_phase2(&self, parent: Phase1Id, message_id: u32) -> Option<Phase2Id> {
        self.phase2
            .iter()
            .find(|(_, phase2)| {
                phase2.parent() == Some(parent) && phase2.message_id() == message_id
            })
            .map(|(id, _)| *id)
    }

    /// Finds a negotiation for the same traffic, in progress or established.
    pub fn find_phase2_by_selectors(
        &self,
        remote: IpAddr,
        selectors: &TrafficSelectors,
    ) -> Option<Phase2Id> {
        self.phase2
            .iter()
            .find(|(_, phase2)| {
                phase2.remote_addr().ip() == remote
                    && phase2.selectors() == selectors
                    && !phase2.is_expired()
            })
            .map(|(id, _)| *id)
    }

    /// Finds negotiations by an SPI from a Delete payload (either direction).
    pub fn find_phase2_by_spi(
        &self,
        remote: IpAddr,
        protocol: IpsecProtocol,
        spi: u32,
    ) -> Vec<Phase2Id> {
        let mut ids = self
            .phase2
            .iter()
            .filter(|(_, phase2)| {
                phase2.remote_addr().ip() == remote
                    && phase2.protocol() == Some(protocol)
                    && (phase2.peer_spi() == Some(spi) || phase2.local_spi() == Some(spi))
            })
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn children(&self, parent: Phase1Id) -> Vec<Phase2Id> {
        let mut ids = self
            .phase2
            .iter()
            .filter(|(_, phase2)| phase2.parent() == Some(parent))
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Initiator negotiations still waiting for a phase 1 SA with a peer.
    pub fn unbound_phase2_for(&self, remote: IpAddr) -> Vec<Phase2Id> {
        let mut ids = self
            .phase2
            .iter()
            .filter(|(_, phase2)| phase2.parent().is_none() && phase2.remote_addr().ip() == remote)
            .map(|(id, _)| *id)
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub fn message_id_in_use(&self, parent: Phase1Id, message_id: u32) -> bool {
        self.find_phase2(parent, message_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, time::Duration, time::Instant};

    use super::super::crypto::{DhGroup, EncryptionAlgorithm, HashAlgorithm};
    use super::super::policy::{
        AuthMethod, Encapsulation, EspCipher, IpsecTransform, Phase1Proposal, Policy, PskTable,
        RemoteConfig, Sainfo, Subnet,
    };
    use super::*;

    fn policy() -> Policy {
        let remote = RemoteConfig::new(
            None,
            vec![Phase1Proposal {
                encryption: EncryptionAlgorithm::Aes(16),
                hash: HashAlgorithm::Sha1,
                auth: AuthMethod::PreSharedKey,
                dh_group: DhGroup::Modp1024,
                lifetime: Duration::from_secs(28800),
            }],
        );
        Policy::new(vec![remote], vec![], PskTable::new(), None)
    }

    fn phase1(policy: &Policy, cookie: u64, remote: &str) -> Phase1 {
        let remote_addr: SocketAddr = remote.parse().unwrap();
        let local_addr: SocketAddr = "192.0.2.1:500".parse().unwrap();
        Phase1::new_initiator(
            policy,
            policy.remote_for(remote_addr.ip()).unwrap(),
            cookie,
            remote_addr,
            local_addr,
            Instant::now(),
        )
        .unwrap()
    }

    fn selectors(remote: &str) -> TrafficSelectors {
        TrafficSelectors {
            local: Subnet::parse("10.1.0.0/16").unwrap(),
            remote: Subnet::parse(remote).unwrap(),
        }
    }

    fn phase2(selectors: TrafficSelectors) -> Phase2 {
        Phase2::new_initiator(
            selectors,
            Sainfo {
                selectors: None,
                transforms: vec![IpsecTransform::esp(EspCipher::Aes(16), None)],
                encapsulation: Encapsulation::Tunnel,
                pfs_group: None,
                lifetime: Duration::from_secs(3600),
            },
            "192.0.2.2:500".parse().unwrap(),
            "192.0.2.1:500".parse().unwrap(),
            Instant::now(),
        )
    }

    #[test]
    fn phase1_lookup() {
        let policy = policy();
        let mut registry = Registry::new();
        let first = registry.insert_phase1(phase1(&policy, 0x10, "192.0.2.2:500"));
        let second = registry.insert_phase1(phase1(&policy, 0x20, "192.0.2.3:500"));
        assert_ne!(first, second);
        assert_eq!(registry.find_phase1(&Index::new(0x10, 0)), Some(first));
        assert_eq!(registry.find_phase1(&Index::new(0x10, 0x99)), None);
        assert_eq!(registry.find_phase1_by_initiator_cookie(0x20), Some(second));
        assert_eq!(registry.find_phase1_awaiting_responder(0x20), Some(second));
        assert_eq!(registry.find_phase1_awaiting_responder(0x30), None);
        let remote: IpAddr = "192.0.2.2".parse().unwrap();
        assert_eq!(registry.established_phase1_for(remote), None);
        assert_eq!(registry.active_phase1_for(remote), Some(first));
        assert_eq!(registry.phase1_for_peer(remote), vec![first]);
        assert!(registry.remove_phase1(first).is_some());
        assert_eq!(registry.phase1_ids(), vec![second]);
    }

    #[test]
    fn phase2_lookup() {
        let policy = policy();
        let mut registry = Registry::new();
        let parent = registry.insert_phase1(phase1(&policy, 0x10, "192.0.2.2:500"));
        let remote: IpAddr = "192.0.2.2".parse().unwrap();

        let unbound = registry.insert_phase2(phase2(selectors("10.2.0.0/16")));
        assert_eq!(registry.unbound_phase2_for(remote), vec![unbound]);
        assert!(registry.phase2_with_parent_mut(unbound).is_none());

        let bound = registry.insert_phase2(phase2(selectors("10.3.0.0/16")));
        registry
            .phase2_mut(bound)
            .unwrap()
            .bind(parent, 0xabcd)
            .unwrap();
        assert_eq!(registry.find_phase2(parent, 0xabcd), Some(bound));
        assert!(registry.message_id_in_use(parent, 0xabcd));
        assert!(!registry.message_id_in_use(parent, 0xabce));
        assert_eq!(registry.children(parent), vec![bound]);
        assert_eq!(
            registry.find_phase2_by_selectors(remote, &selectors("10.2.0.0/16")),
            Some(unbound)
        );
        let (parent_ref, child) = registry.phase2_with_parent_mut(bound).unwrap();
        assert_eq!(parent_ref.index().initiator_cookie, 0x10);
        assert_eq!(child.message_id(), 0xabcd);
        assert!(registry.find_phase2_by_spi(remote, IpsecProtocol::Esp, 1).is_empty());
    }
}
