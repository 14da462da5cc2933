use std::collections::BTreeSet;

/// Instance names that may receive deployments outside a sandbox.
///
/// Names are stored upper-cased; matching is case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    names: BTreeSet<String>,
}

impl AllowList {
    /// Parses the comma-separated form used by `ALLOWED_INSTANCE_NAMES`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        raw.split(',').collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn contains(&self, instance_name: &str) -> bool {
        self.names.contains(&instance_name.trim().to_uppercase())
    }

    /// Names in display order, joined with `", "`.
    #[must_use]
    pub fn display(&self) -> String {
        self.names.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

impl<S: AsRef<str>> FromIterator<S> for AllowList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let names = iter
            .into_iter()
            .map(|s| s.as_ref().trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        Self { names }
    }
}

/// Outcome of [`decide`]. `reason` is always populated and safe to show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
}

/// Decides whether an account may receive a deployment.
///
/// 1. sandbox accounts are always eligible;
/// 2. otherwise the instance name must be in a non-empty allow-list;
/// 3. with an empty allow-list only sandboxes are eligible.
#[must_use]
pub fn decide(is_sandbox: bool, instance_name: Option<&str>, allow_list: &AllowList) -> Decision {
    if is_sandbox {
        return Decision {
            allowed: true,
            reason: "Sandbox org detected".into(),
        };
    }

    if allow_list.is_empty() {
        return Decision {
            allowed: false,
            reason: "This deployment tool only allows Sandbox orgs. Please log in to a Sandbox \
                     org, or configure allowed instance names."
                .into(),
        };
    }

    match instance_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) if allow_list.contains(name) => Decision {
            allowed: true,
            reason: format!("Instance name {name} is in the allowed list"),
        },
        Some(name) => Decision {
            allowed: false,
            reason: format!(
                "Instance name {name} is not in the allowed list ({}). This deployment tool \
                 only allows Sandbox orgs or orgs with instance names in the configured list.",
                allow_list.display()
            ),
        },
        None => Decision {
            allowed: false,
            reason: "Could not determine instance name. This deployment tool only allows \
                     Sandbox orgs or orgs with instance names in the configured list."
                .into(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(names: &[&str]) -> AllowList {
        names.iter().collect()
    }

    #[test]
    fn sandbox_always_allowed() {
        for names in [&[][..], &["NA123"][..], &["CS1", "EU5"][..]] {
            for instance in [None, Some(""), Some("NA123"), Some("whatever")] {
                let decision = decide(true, instance, &list(names));
                assert!(decision.allowed, "{names:?} {instance:?}");
                assert!(!decision.reason.is_empty());
            }
        }
    }

    #[test]
    fn listed_instance_allowed() {
        let decision = decide(false, Some("NA123"), &list(&["NA123"]));
        assert!(decision.allowed);
    }

    #[test]
    fn listed_instance_matches_case_insensitively() {
        assert!(decide(false, Some("na123"), &list(&["NA123"])).allowed);
        assert!(decide(false, Some("NA123"), &list(&["na123"])).allowed);
    }

    #[test]
    fn unlisted_instance_denied_with_name() {
        let decision = decide(false, Some("NA999"), &list(&["NA123"]));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("NA999"));
        assert!(decision.reason.contains("NA123"));
    }

    #[test]
    fn missing_instance_denied() {
        let decision = decide(false, None, &list(&["NA123"]));
        assert!(!decision.allowed);
        assert!(decision.reason.contains("Could not determine instance name"));
    }

    #[test]
    fn empty_allow_list_denies_production() {
        let decision = decide(false, None, &AllowList::default());
        assert!(!decision.allowed);
        assert!(decision.reason.contains("only allows Sandbox orgs"));

        assert!(!decide(false, Some("NA123"), &AllowList::default()).allowed);
    }

    #[test]
    fn parse_trims_and_drops_empty_entries() {
        let parsed = AllowList::parse(" na123, ,EU5 ,");
        assert_eq!(parsed, list(&["NA123", "EU5"]));
        assert_eq!(parsed.display(), "EU5, NA123");
        assert!(AllowList::parse("").is_empty());
    }
}
