//! Grouping of packages into protection domains.
//!
//! Two packages share a domain when every sandbox sees them identically: the
//! same set of sandboxes may touch both, each with the same rights. Both
//! backends build on this partition, the VT-x backend to size its views and
//! the MPK backend to hand out one protection key per domain.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{PackageId, SandboxId, UNOWNED_PACKAGE_ID};

/// Which sandboxes touch a package, and with which rights.
type Signature<P> = Vec<(SandboxId, P)>;

/// Result of [`assign`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainAssignment<P> {
    /// Package to domain. A domain is named after its smallest package id.
    domain_of: BTreeMap<PackageId, PackageId>,
    /// Domain to its sorted members. Packages no sandbox touches are listed
    /// under [`UNOWNED_PACKAGE_ID`].
    members: BTreeMap<PackageId, Vec<PackageId>>,
    /// Per sandbox, the domains it may touch with the rights it needs.
    sandboxes: BTreeMap<SandboxId, Vec<(PackageId, P)>>,
}

impl<P> Default for DomainAssignment<P> {
    fn default() -> Self {
        Self {
            domain_of: BTreeMap::new(),
            members: BTreeMap::new(),
            sandboxes: BTreeMap::new(),
        }
    }
}

impl<P: Copy + Ord> DomainAssignment<P> {
    pub fn domain_of(&self, pkg: PackageId) -> Option<PackageId> {
        self.domain_of.get(&pkg).copied()
    }

    /// Domain ids, the unowned pseudo-domain excluded.
    pub fn domains(&self) -> impl Iterator<Item = PackageId> + '_ {
        self.members
            .keys()
            .copied()
            .filter(|d| *d != UNOWNED_PACKAGE_ID)
    }

    pub fn members(&self, domain: PackageId) -> &[PackageId] {
        self.members.get(&domain).map_or(&[], Vec::as_slice)
    }

    pub fn unowned(&self) -> &[PackageId] {
        self.members(UNOWNED_PACKAGE_ID)
    }

    pub fn sandbox(&self, id: &str) -> &[(PackageId, P)] {
        self.sandboxes.get(id).map_or(&[], Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.domains().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The partition itself, independent of domain naming.
    pub fn groups(&self) -> BTreeSet<Vec<PackageId>> {
        self.domains().map(|d| self.members(d).to_vec()).collect()
    }
}

/// Partition `packages` according to the per-sandbox `views`.
///
/// Packages that appear in a view but not in `packages` are still assigned.
/// The output only depends on the inputs, never on iteration order.
pub fn assign<P: Copy + Ord>(
    views: &BTreeMap<SandboxId, BTreeMap<PackageId, P>>,
    packages: impl IntoIterator<Item = PackageId>,
) -> DomainAssignment<P> {
    let mut pending: BTreeMap<PackageId, Signature<P>> = BTreeMap::new();
    for (sandbox, view) in views {
        for (pkg, prot) in view {
            pending
                .entry(*pkg)
                .or_default()
                .push((sandbox.clone(), *prot));
        }
    }

    let mut result = DomainAssignment::default();
    while let Some((first, signature)) = pending.pop_first() {
        let mut group = vec![first];
        group.extend(
            pending
                .iter()
                .filter(|(_, other)| **other == signature)
                .map(|(pkg, _)| *pkg),
        );
        for pkg in &group[1..] {
            pending.remove(pkg);
        }
        group.sort_unstable();

        let domain = group[0];
        for pkg in &group {
            result.domain_of.insert(*pkg, domain);
        }
        crate::debug_domains!("domain {} = {:?}", domain, group);
        result.members.insert(domain, group);
    }

    for pkg in packages {
        if !result.domain_of.contains_key(&pkg) {
            result
                .members
                .entry(UNOWNED_PACKAGE_ID)
                .or_default()
                .push(pkg);
        }
    }
    if let Some(unowned) = result.members.get_mut(&UNOWNED_PACKAGE_ID) {
        unowned.sort_unstable();
        unowned.dedup();
    }

    for (sandbox, view) in views {
        let needs: BTreeSet<(PackageId, P)> = view
            .iter()
            .filter_map(|(pkg, prot)| result.domain_of(*pkg).map(|d| (d, *prot)))
            .collect();
        result
            .sandboxes
            .insert(sandbox.clone(), needs.into_iter().collect());
    }
    result
}
