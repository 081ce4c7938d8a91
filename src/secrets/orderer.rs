use std::collections::BTreeMap;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use crate::secrets::plan::{ErrorPlan, SecretPlan, SelfSigned, X509Plan};

const CYCLE_ERROR: &str = "Cyclical CA signage detected";
const UNREACHED_ERROR: &str = "Could not find associated signing CA";
const AMBIGUOUS_ERROR: &str = "Ambiguous or missing signing CA";

/// Resolve signing relationships and emit plans so that every CA precedes
/// the certificates it signs. Plans that cannot be ordered are downgraded to
/// `error` plans and appended at the end.
///
/// The algorithm never holds references between plans; it works on a
/// path-keyed arena plus a `signer -> [signed]` index.
pub fn order(plans: Vec<X509Plan>, root_ca_path: Option<&str>) -> Vec<SecretPlan> {
    let mut arena: IndexMap<String, X509Plan> = IndexMap::new();
    for plan in plans {
        arena.insert(plan.path.clone(), plan);
    }
    let mut errors: BTreeMap<String, String> = BTreeMap::new();

    classify(&mut arena);
    assign_group_signers(&mut arena, &mut errors);
    assign_fallback_signers(&mut arena, root_ca_path);

    // signer path -> dependent plan paths, in declaration order
    let mut index: IndexMap<String, Vec<String>> = IndexMap::new();
    for (path, plan) in &arena {
        if errors.contains_key(path) {
            continue;
        }
        if let Some(signer) = plan.signer_plan_path() {
            index
                .entry(signer.to_string())
                .or_default()
                .push(path.clone());
        }
    }

    let mut emitted: IndexSet<String> = IndexSet::new();
    let roots: Vec<String> = arena
        .iter()
        .filter(|(path, plan)| {
            !errors.contains_key(*path) && plan.signer_plan_path().is_none()
        })
        .map(|(path, _)| path.clone())
        .collect();
    for root in roots {
        emit(&root, &index, &mut emitted);
    }

    flag_unreached(&arena, &emitted, &mut errors);

    let mut sequence = Vec::new();
    for path in emitted {
        if let Some(plan) = arena.get(&path) {
            sequence.push(SecretPlan::X509(plan.clone()));
        }
    }
    for (path, _) in &arena {
        if let Some(error) = errors.get(path) {
            sequence.push(SecretPlan::Error(ErrorPlan {
                path: path.clone(),
                error: error.clone(),
            }));
        }
    }
    sequence
}

/// A path ending in `/ca` is a CA even without the explicit flag, and a plan
/// naming itself as signer is an explicitly self-signed CA.
fn classify(arena: &mut IndexMap<String, X509Plan>) {
    for (path, plan) in arena.iter_mut() {
        if path.ends_with("/ca") {
            plan.is_ca = true;
        }
        if plan.signed_by.as_deref() == Some(path.as_str()) && !plan.signed_by_abs_path {
            plan.self_signed = SelfSigned::Explicit;
            plan.is_ca = true;
            plan.signed_by = None;
        }
    }
}

/// Within each base-path group, point unsigned non-CA plans at the group CA.
fn assign_group_signers(arena: &mut IndexMap<String, X509Plan>, errors: &mut BTreeMap<String, String>) {
    let mut groups: IndexMap<String, Vec<String>> = IndexMap::new();
    for (path, plan) in arena.iter() {
        groups
            .entry(plan.base_path.clone())
            .or_default()
            .push(path.clone());
    }

    for (base_path, members) in groups {
        let cas: Vec<String> = members
            .iter()
            .filter(|p| arena[p.as_str()].is_ca)
            .cloned()
            .collect();
        let canonical = format!("{base_path}/ca");
        let group_ca = match cas.len() {
            0 => None,
            1 => Some(cas[0].clone()),
            _ if cas.contains(&canonical) => Some(canonical),
            _ => {
                debug!(%base_path, cas = ?cas, "no canonical CA among several");
                for member in &members {
                    let plan = &arena[member.as_str()];
                    if !plan.is_ca && plan.signed_by.is_none() {
                        errors.insert(member.clone(), AMBIGUOUS_ERROR.to_string());
                    }
                }
                None
            }
        };
        if let Some(ca_path) = group_ca {
            for member in &members {
                let plan = arena.get_mut(member.as_str()).unwrap();
                if member != &ca_path && !plan.is_ca && plan.signed_by.is_none() {
                    plan.signed_by = Some(ca_path.clone());
                }
            }
        }
    }
}

/// Anything still unsigned chains to the configured root CA, or self-signs.
fn assign_fallback_signers(arena: &mut IndexMap<String, X509Plan>, root_ca_path: Option<&str>) {
    for (_, plan) in arena.iter_mut() {
        if plan.signed_by.is_some() || plan.self_signed == SelfSigned::Explicit {
            continue;
        }
        match root_ca_path {
            Some(root) => {
                plan.signed_by = Some(root.trim_start_matches('/').to_string());
                plan.signed_by_abs_path = true;
            }
            None => plan.self_signed = SelfSigned::Implicit,
        }
    }
}

fn emit(path: &str, index: &IndexMap<String, Vec<String>>, emitted: &mut IndexSet<String>) {
    if !emitted.insert(path.to_string()) {
        return;
    }
    if let Some(dependents) = index.get(path) {
        for dependent in dependents {
            emit(dependent, index, emitted);
        }
    }
}

/// Plans not reached from any root either chain to a missing signer or sit
/// on a signing cycle; walk each chain to tell the two apart.
fn flag_unreached(
    arena: &IndexMap<String, X509Plan>,
    emitted: &IndexSet<String>,
    errors: &mut BTreeMap<String, String>,
) {
    let remaining: Vec<String> = arena
        .keys()
        .filter(|p| !emitted.contains(*p) && !errors.contains_key(*p))
        .cloned()
        .collect();
    for start in &remaining {
        if errors.contains_key(start) {
            continue;
        }
        let mut walked: IndexSet<String> = IndexSet::new();
        let mut current = start.clone();
        let cycle_start = loop {
            if errors.contains_key(&current) {
                break None;
            }
            if let Some(position) = walked.get_index_of(&current) {
                break Some(position);
            }
            walked.insert(current.clone());
            let next = arena
                .get(&current)
                .and_then(|plan| plan.signer_plan_path())
                .map(str::to_string);
            match next {
                Some(next) if arena.contains_key(&next) && !emitted.contains(&next) => {
                    current = next;
                }
                _ => break None,
            }
        };
        match cycle_start {
            Some(position) => {
                for (i, node) in walked.iter().enumerate() {
                    let message = if i >= position { CYCLE_ERROR } else { UNREACHED_ERROR };
                    errors.entry(node.clone()).or_insert_with(|| message.to_string());
                }
            }
            None => {
                for node in walked {
                    errors
                        .entry(node)
                        .or_insert_with(|| UNREACHED_ERROR.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x509(path: &str, base: &str) -> X509Plan {
        X509Plan::new(path, base)
    }

    fn paths(sequence: &[SecretPlan]) -> Vec<String> {
        sequence.iter().map(|p| p.path()).collect()
    }

    #[test]
    fn group_ca_signs_siblings_and_precedes_them() {
        let mut ca = x509("tls/ca", "tls");
        ca.is_ca = true;
        let mut server = x509("tls/server", "tls");
        server.names = vec!["api.example".into()];
        let ordered = order(vec![server, ca], None);
        assert_eq!(paths(&ordered), vec!["tls/ca", "tls/server"]);
        let SecretPlan::X509(server) = &ordered[1] else {
            panic!("expected x509");
        };
        assert_eq!(server.signed_by.as_deref(), Some("tls/ca"));
        let SecretPlan::X509(ca) = &ordered[0] else {
            panic!("expected x509");
        };
        assert_eq!(ca.self_signed, SelfSigned::Implicit);
    }

    #[test]
    fn signer_always_precedes_signed() {
        let mut ca = x509("a/ca", "a");
        ca.is_ca = true;
        let mut mid = x509("a/intermediate", "a");
        mid.is_ca = true;
        mid.signed_by = Some("a/ca".into());
        let mut leaf = x509("b/server", "b");
        leaf.signed_by = Some("a/intermediate".into());
        let ordered = order(vec![leaf, mid, ca], None);
        let sequence = paths(&ordered);
        for plan in &ordered {
            let SecretPlan::X509(p) = plan else { continue };
            if let Some(signer) = p.signer_plan_path() {
                let signer_at = sequence.iter().position(|s| s == signer).unwrap();
                let own_at = sequence.iter().position(|s| *s == p.path).unwrap();
                assert!(signer_at < own_at, "{signer} must precede {}", p.path);
            }
        }
    }

    #[test]
    fn cycle_is_detected_and_both_plans_error() {
        let mut a = x509("a/ca", "a");
        a.is_ca = true;
        a.signed_by = Some("b/ca".into());
        let mut b = x509("b/ca", "b");
        b.is_ca = true;
        b.signed_by = Some("a/ca".into());
        let ordered = order(vec![a, b], None);
        assert_eq!(ordered.len(), 2);
        for plan in &ordered {
            let SecretPlan::Error(err) = plan else {
                panic!("expected error plan, got {plan:?}");
            };
            assert_eq!(err.error, CYCLE_ERROR);
        }
    }

    #[test]
    fn missing_signer_is_flagged_and_appended() {
        let mut good = x509("tls/ca", "tls");
        good.is_ca = true;
        let mut orphan = x509("other/cert", "other");
        orphan.signed_by = Some("other/gone".into());
        let ordered = order(vec![orphan, good], None);
        assert_eq!(paths(&ordered), vec!["tls/ca", "other/cert"]);
        assert!(matches!(&ordered[1], SecretPlan::Error(e) if e.error == UNREACHED_ERROR));
    }

    #[test]
    fn ambiguous_group_errors_unsigned_leaves() {
        let mut ca1 = x509("svc/signer-one", "svc");
        ca1.is_ca = true;
        let mut ca2 = x509("svc/signer-two", "svc");
        ca2.is_ca = true;
        let leaf = x509("svc/cert", "svc");
        let ordered = order(vec![ca1, ca2, leaf], None);
        let error: Vec<_> = ordered.iter().filter(|p| p.is_error()).collect();
        assert_eq!(error.len(), 1);
        assert_eq!(error[0].path(), "svc/cert");
        let SecretPlan::Error(err) = error[0] else { unreachable!() };
        assert_eq!(err.error, AMBIGUOUS_ERROR);
    }

    #[test]
    fn canonical_ca_wins_among_several() {
        let mut ca = x509("svc/ca", "svc");
        ca.is_ca = true;
        let mut other = x509("svc/backup-ca", "svc");
        other.is_ca = true;
        let leaf = x509("svc/cert", "svc");
        let ordered = order(vec![ca, other, leaf], None);
        let SecretPlan::X509(leaf) = ordered
            .iter()
            .find(|p| p.path() == "svc/cert")
            .unwrap()
        else {
            panic!("expected x509");
        };
        assert_eq!(leaf.signed_by.as_deref(), Some("svc/ca"));
    }

    #[test]
    fn root_ca_fallback_marks_absolute_signer() {
        let mut ca = x509("tls/ca", "tls");
        ca.is_ca = true;
        let ordered = order(vec![ca], Some("/secret/genesis/root-ca"));
        let SecretPlan::X509(ca) = &ordered[0] else {
            panic!("expected x509");
        };
        assert_eq!(ca.signed_by.as_deref(), Some("secret/genesis/root-ca"));
        assert!(ca.signed_by_abs_path);
        assert_eq!(ca.self_signed, SelfSigned::No);
    }

    #[test]
    fn explicit_self_signature_comes_first_in_group() {
        let mut ca = x509("tls/ca", "tls");
        ca.signed_by = Some("tls/ca".into());
        let leaf = x509("tls/server", "tls");
        let ordered = order(vec![leaf, ca], None);
        assert_eq!(paths(&ordered), vec!["tls/ca", "tls/server"]);
        let SecretPlan::X509(ca) = &ordered[0] else {
            panic!("expected x509");
        };
        assert_eq!(ca.self_signed, SelfSigned::Explicit);
        assert!(ca.is_ca);
    }
}
