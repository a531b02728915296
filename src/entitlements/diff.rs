//! Change predicates for the periodic entitlements check.
//!
//! Two independent questions: did anything newly cross its expiry boundary,
//! and did any boolean/name field drift? Either one is reason to tell
//! subscribers to re-read their entitlements.

use super::EffectiveEntitlements;

/// Name of the plan or feature that newly crossed its expiry boundary
/// between `last` and `current`, or `None`.
///
/// "Newly" means expired now but not expired (or untracked) in the last
/// recorded snapshot, so an entry that has been stale for weeks does not
/// re-fire on every check.
pub fn newly_expired(
    current: Option<&EffectiveEntitlements>,
    last: Option<&EffectiveEntitlements>,
    now_ms: i64,
) -> Option<String> {
    let current = current?;

    let crossed = |valid_till: Option<i64>, last_valid_till: Option<i64>| -> bool {
        match valid_till {
            Some(till) if till < now_ms => last_valid_till.is_none_or(|last| last >= now_ms),
            _ => false,
        }
    };

    if let Some(plan) = &current.plan {
        let last_till = last
            .and_then(|l| l.plan.as_ref())
            .and_then(|p| p.valid_till);
        if crossed(plan.valid_till, last_till) {
            return Some(plan.name.clone().unwrap_or_else(|| "plan".into()));
        }
    }

    if let Some(features) = &current.entitlements {
        for (key, feature) in features {
            let last_till = last
                .and_then(|l| l.feature(key))
                .and_then(|f| f.valid_till);
            if crossed(feature.valid_till, last_till) {
                return Some(key.clone());
            }
        }
    }

    None
}

/// Whether any boolean or name field differs between the snapshots.
pub fn have_changed(
    current: Option<&EffectiveEntitlements>,
    last: Option<&EffectiveEntitlements>,
) -> bool {
    let (current, last) = match (current, last) {
        (None, None) => return false,
        (Some(current), Some(last)) => (current, last),
        _ => return true,
    };

    if current.entitlements.is_some() != last.entitlements.is_some() {
        return true;
    }

    if current.is_paid_subscriber() != last.is_paid_subscriber() {
        return true;
    }

    let plan_name = |e: &EffectiveEntitlements| e.plan.as_ref().and_then(|p| p.name.clone());
    if plan_name(current) != plan_name(last) {
        return true;
    }

    if current.is_in_pro_trial != last.is_in_pro_trial {
        return true;
    }

    // Activation flips, over the union of keys so removals count too.
    if let (Some(cur), Some(prev)) = (&current.entitlements, &last.entitlements) {
        for key in cur.keys().chain(prev.keys()) {
            let was = prev.get(key).map(|f| f.activated).unwrap_or(false);
            let is = cur.get(key).map(|f| f.activated).unwrap_or(false);
            if was != is {
                return true;
            }
        }
    }

    false
}
