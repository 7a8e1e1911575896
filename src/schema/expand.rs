//! Schema path stub expansion. A stub token like `%policy_src%` stands for
//! an alternation of sub-paths; a schema line containing one expands to the
//! cross-product of its alternatives before insertion.

/// Stub token → alternatives. Alternatives may themselves contain typed
/// segments or further stubs.
const STUBS: &[(&str, &[&str])] = &[
    (
        "%policy_src%",
        &["site", "rings/%ring%", "clients/%macaddr%"],
    ),
    ("%auth_src%", &["psk", "eap"]),
];

/// Expands every stub in `path` to the cross-product of its alternatives.
/// A stub-free path expands to itself.
pub fn expand_stubs(path: &str) -> Vec<String> {
    for (token, alternatives) in STUBS {
        if path.contains(token) {
            let mut out = Vec::new();
            for alternative in *alternatives {
                let substituted = path.replacen(token, alternative, 1);
                out.extend(expand_stubs(&substituted));
            }
            return out;
        }
    }
    vec![path.to_owned()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_free_paths_pass_through() {
        assert_eq!(
            expand_stubs("@/network/base_address"),
            vec!["@/network/base_address"]
        );
    }

    #[test]
    fn policy_src_expands_to_three_templates() {
        let expanded = expand_stubs("@/policy/%policy_src%/vpn/enabled");
        assert_eq!(
            expanded,
            vec![
                "@/policy/site/vpn/enabled",
                "@/policy/rings/%ring%/vpn/enabled",
                "@/policy/clients/%macaddr%/vpn/enabled",
            ]
        );
    }

    #[test]
    fn multiple_stubs_cross_product() {
        let expanded = expand_stubs("@/x/%auth_src%/%auth_src%");
        assert_eq!(expanded.len(), 4);
        assert!(expanded.contains(&"@/x/psk/eap".to_owned()));
    }
}
