//! ## Identity based access policy
//!
//! Policies are keyed by the uid/gid a guest presented over the local
//! socket and list the identifier ranges it may request, offer and
//! subscribe to. The active policy set is an immutable snapshot that the
//! control path replaces atomically; the data path only ever loads it,
//! so a policy update never blocks message relay.

use codec::{EventgroupId, InstanceId, MethodId, ServiceId};

use std::sync::Arc;

use arc_swap::ArcSwap;

/// Credentials of a guest process as read from the local socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum PolicyMode {
    /// Every operation is allowed, nothing is evaluated.
    Off,
    /// Denied operations are logged but still allowed.
    Audit,
    /// Denied operations are refused.
    Enforced,
}

/// An inclusive identifier range. A single identifier is the range
/// `first == last`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub struct IdRange {
    pub first: u16,
    pub last: u16,
}

impl IdRange {
    pub fn single(id: u16) -> Self {
        Self { first: id, last: id }
    }

    pub fn any() -> Self {
        Self { first: 0, last: u16::MAX }
    }

    fn contains(&self, id: u16) -> bool {
        self.first <= id && id <= self.last
    }
}

/// What one policy allows for one service: a set of instance ranges and a
/// set of method (or eventgroup) ranges, both kept sorted by `first`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub service: ServiceId,
    pub instances: Vec<IdRange>,
    pub methods: Vec<IdRange>,
}

impl Rule {
    fn matches(&self, instance: InstanceId, method: Option<MethodId>) -> bool {
        contains_sorted(&self.instances, instance)
            && method.is_none_or(|method| contains_sorted(&self.methods, method))
    }
}

/// Binary search over ranges sorted by `first`. The candidate range is
/// the last one starting at or before `id`.
fn contains_sorted(ranges: &[IdRange], id: u16) -> bool {
    let candidate = ranges.partition_point(|range| range.first <= id);
    candidate > 0 && ranges[candidate - 1].contains(id)
}

/// All rules granted to one uid/gid pair. `None` matches any id, the way
/// a wildcard credential entry in the security configuration does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    /// Sorted by service id.
    pub requests: Vec<Rule>,
    pub offers: Vec<Rule>,
    pub eventgroups: Vec<Rule>,
}

impl Policy {
    fn applies_to(&self, credentials: &Credentials) -> bool {
        self.uid.is_none_or(|uid| uid == credentials.uid)
            && self.gid.is_none_or(|gid| gid == credentials.gid)
    }
}

/// The direction of the checked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Request,
    Offer,
    Subscribe,
}

/// An immutable policy snapshot plus the enforcement mode.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    pub policies: Vec<Policy>,
}

impl PolicySet {
    /// Normalize: sort every rule list so lookups can binary search.
    pub fn prepare(mut self) -> Self {
        for policy in &mut self.policies {
            for rules in [&mut policy.requests, &mut policy.offers, &mut policy.eventgroups] {
                rules.sort_by_key(|rule| rule.service);
                for rule in rules.iter_mut() {
                    rule.instances.sort_by_key(|range| range.first);
                    rule.methods.sort_by_key(|range| range.first);
                }
            }
        }

        self
    }

    fn grants(
        &self,
        credentials: &Credentials,
        access: Access,
        service: ServiceId,
        instance: InstanceId,
        method: Option<MethodId>,
    ) -> bool {
        self.policies
            .iter()
            .filter(|policy| policy.applies_to(credentials))
            .any(|policy| {
                let rules = match access {
                    Access::Request => &policy.requests,
                    Access::Offer => &policy.offers,
                    Access::Subscribe => &policy.eventgroups,
                };

                match rules.binary_search_by_key(&service, |rule| rule.service) {
                    Ok(index) => rules[index].matches(instance, method),
                    Err(_) => false,
                }
            })
    }
}

pub struct PolicyEngine {
    mode: PolicyMode,
    snapshot: ArcSwap<PolicySet>,
}

impl PolicyEngine {
    pub fn new(mode: PolicyMode, set: PolicySet) -> Self {
        Self {
            mode,
            snapshot: ArcSwap::from_pointee(set.prepare()),
        }
    }

    /// Replace the active policy set. Only the control path calls this.
    pub fn update(&self, set: PolicySet) {
        self.snapshot.store(Arc::new(set.prepare()));
    }

    /// Whether `credentials` may perform the operation.
    ///
    /// In `Audit` mode a denial is logged and the operation allowed
    /// anyway; in `Enforced` mode the caller must refuse it.
    ///
    /// # Test
    ///
    /// ```
    /// use someip_router_service::policy::*;
    ///
    /// let engine = PolicyEngine::new(
    ///     PolicyMode::Enforced,
    ///     PolicySet {
    ///         policies: vec![Policy {
    ///             uid: Some(1000),
    ///             gid: None,
    ///             requests: vec![Rule {
    ///                 service: 0x1234,
    ///                 instances: vec![IdRange::any()],
    ///                 methods: vec![IdRange { first: 0x0001, last: 0x00FF }],
    ///             }],
    ///             ..Default::default()
    ///         }],
    ///     },
    /// );
    ///
    /// let granted = Credentials { uid: 1000, gid: 1000 };
    /// let stranger = Credentials { uid: 1001, gid: 1001 };
    ///
    /// assert!(engine.authorize(&granted, Access::Request, 0x1234, 0x0001, 0x0042));
    /// assert!(!engine.authorize(&granted, Access::Request, 0x1234, 0x0001, 0x4242));
    /// assert!(!engine.authorize(&stranger, Access::Request, 0x1234, 0x0001, 0x0042));
    /// ```
    pub fn authorize(
        &self,
        credentials: &Credentials,
        access: Access,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> bool {
        self.evaluate(credentials, access, service, instance, Some(method))
    }

    /// Like [`PolicyEngine::authorize`] for operations on a whole
    /// service instance (offering, requesting), where no method is
    /// involved.
    pub fn authorize_service(
        &self,
        credentials: &Credentials,
        access: Access,
        service: ServiceId,
        instance: InstanceId,
    ) -> bool {
        self.evaluate(credentials, access, service, instance, None)
    }

    pub fn authorize_subscribe(
        &self,
        credentials: &Credentials,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> bool {
        self.evaluate(credentials, Access::Subscribe, service, instance, Some(eventgroup))
    }

    fn evaluate(
        &self,
        credentials: &Credentials,
        access: Access,
        service: ServiceId,
        instance: InstanceId,
        method: Option<MethodId>,
    ) -> bool {
        if self.mode == PolicyMode::Off {
            return true;
        }

        if self.snapshot.load().grants(credentials, access, service, instance, method) {
            return true;
        }

        log::warn!(
            "policy denied: uid={}, gid={}, access={access:?}, service={service:#06x}, instance={instance:#06x}, method={:#06x}",
            credentials.uid,
            credentials.gid,
            method.unwrap_or(0),
        );

        self.mode == PolicyMode::Audit
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials { uid: 1000, gid: 1000 }
    }

    fn single_rule_set(methods: Vec<IdRange>) -> PolicySet {
        PolicySet {
            policies: vec![Policy {
                uid: Some(1000),
                gid: Some(1000),
                requests: vec![Rule {
                    service: 0x1234,
                    instances: vec![IdRange::single(0x0001)],
                    methods,
                }],
                ..Default::default()
            }],
        }
    }

    #[test]
    fn off_mode_allows_everything() {
        let engine = PolicyEngine::new(PolicyMode::Off, PolicySet::default());

        assert!(engine.authorize(&credentials(), Access::Offer, 1, 1, 1));
    }

    #[test]
    fn audit_mode_allows_denied_operations() {
        let engine = PolicyEngine::new(PolicyMode::Audit, PolicySet::default());

        assert!(engine.authorize(&credentials(), Access::Request, 1, 1, 1));
    }

    #[test]
    fn ranges_are_found_among_many() {
        let ranges = (0..100u16)
            .map(|i| IdRange { first: i * 10, last: i * 10 + 5 })
            .collect::<Vec<_>>();

        let engine = PolicyEngine::new(PolicyMode::Enforced, single_rule_set(ranges));

        assert!(engine.authorize(&credentials(), Access::Request, 0x1234, 0x0001, 153));
        assert!(!engine.authorize(&credentials(), Access::Request, 0x1234, 0x0001, 157));
        assert!(!engine.authorize(&credentials(), Access::Request, 0x1234, 0x0002, 153));
    }

    #[test]
    fn update_replaces_the_snapshot() {
        let engine = PolicyEngine::new(PolicyMode::Enforced, single_rule_set(vec![IdRange::any()]));
        assert!(engine.authorize(&credentials(), Access::Request, 0x1234, 0x0001, 0x0042));

        engine.update(PolicySet::default());
        assert!(!engine.authorize(&credentials(), Access::Request, 0x1234, 0x0001, 0x0042));
    }
}
