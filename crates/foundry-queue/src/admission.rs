use foundry_core::QueueConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Counters {
    providers: HashMap<String, usize>,
    groups: HashMap<String, usize>,
}

/// Per-provider and per-group concurrency ceilings for running jobs.
///
/// Counters are process-local and guarded by one mutex so that checking a
/// provider and its group and then incrementing both happens atomically.
/// A granted slot is held by an [`AdmissionPermit`] and returned on drop.
pub struct AdmissionController {
    provider_limits: HashMap<String, usize>,
    default_limit: usize,
    /// provider id -> (group id, group ceiling)
    membership: HashMap<String, (String, usize)>,
    counters: Arc<Mutex<Counters>>,
}

impl AdmissionController {
    /// Controller with every counter at zero.
    pub fn new(config: &QueueConfig) -> Self {
        let provider_limits = config
            .providers
            .iter()
            .map(|p| (p.id.clone(), p.max_concurrent))
            .collect();
        let mut membership = HashMap::new();
        for group in &config.groups {
            for provider in &group.providers {
                membership.insert(provider.clone(), (group.id.clone(), group.max_concurrent));
            }
        }
        Self {
            provider_limits,
            default_limit: config.default_provider_concurrency,
            membership,
            counters: Arc::new(Mutex::new(Counters::default())),
        }
    }

    /// Ceiling for `provider`, falling back to the configured default.
    pub fn provider_limit(&self, provider: &str) -> usize {
        self.provider_limits
            .get(provider)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Group `provider` belongs to, if any.
    pub fn group_of(&self, provider: &str) -> Option<&str> {
        self.membership.get(provider).map(|(id, _)| id.as_str())
    }

    /// Take a slot for `provider`, or `None` if the provider or its group is full.
    pub fn try_admit(&self, provider: &str) -> Option<AdmissionPermit> {
        let limit = self.provider_limit(provider);
        let group = self.membership.get(provider);

        let mut counters = self.counters.lock();
        let active = counters.providers.get(provider).copied().unwrap_or(0);
        if active >= limit {
            return None;
        }
        if let Some((group_id, group_limit)) = group {
            let group_active = counters.groups.get(group_id).copied().unwrap_or(0);
            if group_active >= *group_limit {
                return None;
            }
            *counters.groups.entry(group_id.clone()).or_insert(0) += 1;
        }
        *counters.providers.entry(provider.to_string()).or_insert(0) += 1;

        Some(AdmissionPermit {
            counters: Arc::clone(&self.counters),
            provider: provider.to_string(),
            group: group.map(|(id, _)| id.clone()),
        })
    }

    /// Slots currently held for `provider`.
    pub fn active(&self, provider: &str) -> usize {
        self.counters
            .lock()
            .providers
            .get(provider)
            .copied()
            .unwrap_or(0)
    }

    /// Slots currently held across `group`.
    pub fn active_in_group(&self, group: &str) -> usize {
        self.counters.lock().groups.get(group).copied().unwrap_or(0)
    }
}

/// A held admission slot. Dropping it frees the slot.
pub struct AdmissionPermit {
    counters: Arc<Mutex<Counters>>,
    provider: String,
    group: Option<String>,
}

impl AdmissionPermit {
    /// Provider the slot was taken for.
    pub fn provider(&self) -> &str {
        &self.provider
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let mut counters = self.counters.lock();
        if let Some(n) = counters.providers.get_mut(&self.provider) {
            *n = n.saturating_sub(1);
        }
        if let Some(group) = &self.group {
            if let Some(n) = counters.groups.get_mut(group) {
                *n = n.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use foundry_core::{ProviderGroup, ProviderLimit};

    fn config() -> QueueConfig {
        QueueConfig {
            default_provider_concurrency: 2,
            providers: vec![ProviderLimit {
                id: "solo".into(),
                max_concurrent: 1,
            }],
            groups: vec![ProviderGroup {
                id: "shared-account".into(),
                providers: vec!["alpha".into(), "beta".into()],
                max_concurrent: 3,
            }],
            ..QueueConfig::default()
        }
    }

    #[test]
    fn test_provider_ceiling() {
        let admission = AdmissionController::new(&config());
        let first = admission.try_admit("solo").unwrap();
        assert!(admission.try_admit("solo").is_none());
        drop(first);
        assert!(admission.try_admit("solo").is_some());
    }

    #[test]
    fn test_default_ceiling_applies_to_unlisted_providers() {
        let admission = AdmissionController::new(&config());
        let _a = admission.try_admit("other").unwrap();
        let _b = admission.try_admit("other").unwrap();
        assert!(admission.try_admit("other").is_none());
        assert_eq!(admission.active("other"), 2);
    }

    #[test]
    fn test_group_ceiling_is_shared_across_members() {
        let admission = AdmissionController::new(&config());
        let _a1 = admission.try_admit("alpha").unwrap();
        let _a2 = admission.try_admit("alpha").unwrap();
        let b1 = admission.try_admit("beta").unwrap();
        // group full at 3 even though beta alone is at 1 of 2
        assert!(admission.try_admit("beta").is_none());
        assert_eq!(admission.active_in_group("shared-account"), 3);

        drop(b1);
        assert_eq!(admission.active_in_group("shared-account"), 2);
        assert!(admission.try_admit("beta").is_some());
    }

    #[test]
    fn test_rejected_admission_does_not_leak_counts() {
        let admission = AdmissionController::new(&config());
        let _a1 = admission.try_admit("alpha").unwrap();
        let _a2 = admission.try_admit("alpha").unwrap();
        assert!(admission.try_admit("alpha").is_none());
        assert_eq!(admission.active("alpha"), 2);
        assert_eq!(admission.active_in_group("shared-account"), 2);
    }
}
