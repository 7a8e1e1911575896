//! The schema upgrade pipeline: a dense sequence of versioned transforms
//! applied to the persisted tree at startup. `@/cfgversion` records how
//! far a tree has come; each registered hook lifts it one version.

use anyhow::{bail, Context};
use time::OffsetDateTime;

use crate::{store::Store, tree::PropTree};

/// Oldest tree this daemon can still upgrade.
pub const MIN_VERSION: u32 = 10;

/// The version fresh trees are written at.
pub const CUR_VERSION: u32 = 13;

type UpgradeFn = fn(&mut PropTree) -> anyhow::Result<()>;

/// Hook registered under version `v` transforms a `v` tree into a `v+1`
/// tree. The sequence must be dense from MIN_VERSION to CUR_VERSION.
const REGISTRY: &[(u32, UpgradeFn)] = &[
    (10, upgrade_lowercase_macs),
    (11, upgrade_leases_to_clients),
    (12, upgrade_default_firewall_rules),
];

pub fn current_version(tree: &PropTree) -> anyhow::Result<u32> {
    let path = tree.parse("@/cfgversion")?;
    let raw = tree
        .get_prop(&path, OffsetDateTime::now_utc())
        .context("tree has no @/cfgversion")?;
    raw.parse()
        .with_context(|| format!("bad @/cfgversion '{raw}'"))
}

/// Runs every applicable upgrade hook in version order, bumping
/// `@/cfgversion` and persisting after each step. Any failure aborts
/// startup.
pub fn run(tree: &mut PropTree, store: &Store) -> anyhow::Result<()> {
    let version = current_version(tree)?;
    if version < MIN_VERSION {
        bail!("tree version {version} is older than the supported minimum {MIN_VERSION}");
    }
    if version > CUR_VERSION {
        bail!("tree version {version} is newer than this daemon supports ({CUR_VERSION})");
    }

    for step in version..CUR_VERSION {
        let Some((_, hook)) = REGISTRY.iter().find(|(v, _)| *v == step) else {
            bail!("no upgrade hook registered for version {step}");
        };

        log::info!("upgrading property tree v{step} -> v{}", step + 1);
        tree.changeset_init();
        let outcome = hook(tree).and_then(|()| {
            let path = tree.parse("@/cfgversion")?;
            tree.add(&path, &(step + 1).to_string(), None)?;
            Ok(())
        });

        match outcome {
            Ok(()) => {
                tree.changeset_commit(OffsetDateTime::now_utc());
            }
            Err(err) => {
                tree.changeset_revert();
                return Err(err.context(format!("upgrade v{step} failed")));
            }
        }

        store
            .save(tree)
            .with_context(|| format!("persisting upgraded tree at v{}", step + 1))?;
    }

    Ok(())
}

/// v10 → v11: client records used to be keyed by whatever case the radio
/// reported; normalize every MAC key to lowercase.
fn upgrade_lowercase_macs(tree: &mut PropTree) -> anyhow::Result<()> {
    let clients = tree.parse("@/clients")?;
    let macs: Vec<String> = tree
        .get_children(&clients)
        .into_iter()
        .map(|id| tree.node(id).name().to_owned())
        .collect();

    for mac in macs {
        let lowered = mac.to_ascii_lowercase();
        if lowered == mac {
            continue;
        }
        log::info!("renaming client record {mac} -> {lowered}");
        let old = tree.parse(&format!("@/clients/{mac}"))?;
        let new = tree.parse(&format!("@/clients/{lowered}"))?;
        if tree.lookup(&new).is_some() {
            // Both spellings present; the lowercase record wins.
            tree.delete(&old)?;
        } else {
            tree.move_to(&old, &new)?;
        }
    }
    Ok(())
}

/// v11 → v12: the obsolete `@/dhcp/leases` table becomes per-client ipv4
/// records, expiring with the original lease.
fn upgrade_leases_to_clients(tree: &mut PropTree) -> anyhow::Result<()> {
    let leases = tree.parse("@/dhcp/leases")?;
    let entries: Vec<(String, String, Option<OffsetDateTime>)> = tree
        .get_children(&leases)
        .into_iter()
        .map(|id| {
            let node = tree.node(id);
            (
                node.name().to_owned(),
                node.value().to_owned(),
                node.expires(),
            )
        })
        .collect();

    for (mac, address, expires) in entries {
        if address.is_empty() {
            continue;
        }
        let target = tree.parse(&format!("@/clients/{mac}/ipv4"))?;
        if tree.lookup(&target).is_some() {
            continue;
        }
        log::info!("migrating lease for {mac} to client record");
        tree.add(&target, &address, expires)?;
    }

    let dhcp = tree.parse("@/dhcp")?;
    if tree.lookup(&dhcp).is_some() {
        tree.delete(&dhcp)?;
    }
    Ok(())
}

/// v12 → v13: guarantee the baseline firewall rule set exists.
fn upgrade_default_firewall_rules(tree: &mut PropTree) -> anyhow::Result<()> {
    let rule = tree.parse("@/firewall/rules/default_deny/rule")?;
    if tree.lookup(&rule).is_none() {
        tree.add(&rule, "BLOCK FROM IFACE wan TO AP", None)?;
        let active = tree.parse("@/firewall/rules/default_deny/active")?;
        tree.add(&active, "true", None)?;
    }
    Ok(())
}
