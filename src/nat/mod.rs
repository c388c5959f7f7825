use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::observability;
use crate::ports::PortMap;

pub mod iptables;
pub mod memory;

pub use iptables::{CommandOutput, CommandRunner, IptablesTable, SystemCommandRunner};
pub use memory::MemoryNatTable;

pub const REWRITE_CHAIN: &str = "GRACEFUL_MONITOR_REWRITE";

pub const JUMP_CHAINS: [&str; 2] = ["PREROUTING", "OUTPUT"];

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RuleSpec(Vec<String>);

impl RuleSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(args.into_iter().map(Into::into).collect())
    }

    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split_whitespace())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }

    pub fn jump(chain: &str) -> Self {
        Self::new(["-j", chain])
    }

    pub fn dnat(target_port: u16, destination_port: u16) -> Self {
        let mut args = vec!["-p".to_string(), "tcp".to_string()];
        args.extend(dnat_tail(target_port, destination_port));
        Self(args)
    }

    pub fn established_dnat(target_port: u16, destination_port: u16) -> Self {
        let mut args = ["-p", "tcp", "-m", "state", "--state", "RELATED,ESTABLISHED"]
            .map(String::from)
            .to_vec();
        args.extend(dnat_tail(target_port, destination_port));
        Self(args)
    }

    pub fn is_established_only(&self) -> bool {
        self.0.iter().any(|arg| arg == "--state")
    }
}

fn dnat_tail(target_port: u16, destination_port: u16) -> Vec<String> {
    vec![
        "-m".to_string(),
        "addrtype".to_string(),
        "--dst-type".to_string(),
        "LOCAL".to_string(),
        "-m".to_string(),
        "tcp".to_string(),
        "--dport".to_string(),
        target_port.to_string(),
        "-j".to_string(),
        "DNAT".to_string(),
        "--to-destination".to_string(),
        format!(":{destination_port}"),
    ]
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(" "))
    }
}

pub trait NatTable {
    fn chain_exists(&self, chain: &str) -> Result<bool>;

    fn new_chain(&self, chain: &str) -> Result<()>;

    fn rule_exists(&self, chain: &str, rule: &RuleSpec) -> Result<bool>;

    fn append(&self, chain: &str, rule: &RuleSpec) -> Result<()>;

    fn list_rules(&self, chain: &str) -> Result<Vec<RuleSpec>>;

    fn delete(&self, chain: &str, rule: &RuleSpec) -> Result<()>;

    fn append_unique(&self, chain: &str, rule: &RuleSpec) -> Result<bool> {
        if self.rule_exists(chain, rule)? {
            return Ok(false);
        }
        self.append(chain, rule)?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub appended: usize,
    pub deleted: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.appended == 0 && self.deleted == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleChanges {
    pub append: Vec<RuleSpec>,
    pub delete: Vec<RuleSpec>,
}

impl RuleChanges {
    pub fn is_empty(&self) -> bool {
        self.append.is_empty() && self.delete.is_empty()
    }
}

pub fn active_rules(ports: &PortMap) -> Vec<RuleSpec> {
    ports
        .entries()
        .into_iter()
        .map(|(target, destination)| RuleSpec::dnat(target, destination))
        .collect()
}

pub fn transition_rules(active: &PortMap, next: &PortMap) -> Vec<RuleSpec> {
    let established = active
        .entries()
        .into_iter()
        .map(|(target, destination)| RuleSpec::established_dnat(target, destination));
    established.chain(active_rules(next)).collect()
}

/// Computes the appends and deletes that turn `actual` into `desired`.
///
/// Repeated copies of a desired rule beyond the first are deleted too, so
/// the result always leaves exactly one instance of each desired rule.
pub fn plan_rule_changes(desired: &[RuleSpec], actual: &[RuleSpec]) -> RuleChanges {
    let wanted = desired.iter().collect::<HashSet<_>>();
    let mut kept = HashSet::new();
    let mut changes = RuleChanges::default();

    for rule in actual {
        if wanted.contains(rule) && kept.insert(rule) {
            continue;
        }
        changes.delete.push(rule.clone());
    }

    let mut queued = HashSet::new();
    for rule in desired {
        if !kept.contains(rule) && queued.insert(rule) {
            changes.append.push(rule.clone());
        }
    }

    changes
}

pub fn ensure_active_rules<T>(table: &T, ports: &PortMap) -> Result<ReconcileOutcome>
where
    T: NatTable + ?Sized,
{
    reconcile(table, "active", &active_rules(ports))
}

pub fn ensure_transition_rules<T>(
    table: &T,
    active: &PortMap,
    next: &PortMap,
) -> Result<ReconcileOutcome>
where
    T: NatTable + ?Sized,
{
    reconcile(table, "transition", &transition_rules(active, next))
}

fn ensure_chain<T>(table: &T) -> Result<usize>
where
    T: NatTable + ?Sized,
{
    let mut appended = 0;
    if !table
        .chain_exists(REWRITE_CHAIN)
        .with_context(|| format!("failed checking chain {REWRITE_CHAIN}"))?
    {
        table
            .new_chain(REWRITE_CHAIN)
            .with_context(|| format!("failed creating chain {REWRITE_CHAIN}"))?;
        debug!(chain = REWRITE_CHAIN, "created rewrite chain");
    }

    let jump = RuleSpec::jump(REWRITE_CHAIN);
    for chain in JUMP_CHAINS {
        if table
            .append_unique(chain, &jump)
            .with_context(|| format!("failed ensuring jump from {chain} to {REWRITE_CHAIN}"))?
        {
            debug!(chain, target = REWRITE_CHAIN, "added jump rule");
            appended += 1;
        }
    }
    Ok(appended)
}

fn reconcile<T>(table: &T, operation: &str, desired: &[RuleSpec]) -> Result<ReconcileOutcome>
where
    T: NatTable + ?Sized,
{
    let mut outcome = ReconcileOutcome {
        appended: ensure_chain(table)?,
        deleted: 0,
    };

    let actual = table
        .list_rules(REWRITE_CHAIN)
        .with_context(|| format!("failed listing rules in {REWRITE_CHAIN}"))?;
    let changes = plan_rule_changes(desired, &actual);

    for rule in &changes.append {
        table
            .append(REWRITE_CHAIN, rule)
            .with_context(|| format!("failed appending '{rule}' to {REWRITE_CHAIN}"))?;
        debug!(operation, rule = %rule, "appended rule");
        outcome.appended += 1;
    }
    for rule in &changes.delete {
        table
            .delete(REWRITE_CHAIN, rule)
            .with_context(|| format!("failed deleting '{rule}' from {REWRITE_CHAIN}"))?;
        debug!(operation, rule = %rule, "deleted stale rule");
        outcome.deleted += 1;
    }

    observability::record_rule_changes(operation, outcome.appended, outcome.deleted);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::{
        active_rules, ensure_active_rules, ensure_transition_rules, plan_rule_changes,
        transition_rules, MemoryNatTable, NatTable, RuleSpec, REWRITE_CHAIN,
    };
    use crate::ports::{PortMap, Slot};

    fn chain_rules(table: &MemoryNatTable) -> Vec<RuleSpec> {
        table.list_rules(REWRITE_CHAIN).expect("list rules")
    }

    #[test]
    fn dnat_rule_uses_listing_form() {
        assert_eq!(
            RuleSpec::dnat(6443, 6444).to_string(),
            "-p tcp -m addrtype --dst-type LOCAL -m tcp --dport 6443 -j DNAT --to-destination :6444"
        );
        let established = RuleSpec::established_dnat(6080, 6080);
        assert_eq!(
            established.to_string(),
            "-p tcp -m state --state RELATED,ESTABLISHED -m addrtype --dst-type LOCAL -m tcp --dport 6080 -j DNAT --to-destination :6080"
        );
        assert!(established.is_established_only());
        assert_eq!(RuleSpec::parse(&established.to_string()), established);
    }

    #[test]
    fn plan_deletes_extras_and_duplicates() {
        let desired = active_rules(&PortMap::for_slot(Slot::Zero));
        let stale = RuleSpec::dnat(6443, 6445);
        let actual = vec![desired[0].clone(), stale.clone(), desired[0].clone()];

        let changes = plan_rule_changes(&desired, &actual);

        assert_eq!(changes.delete, vec![stale, desired[0].clone()]);
        assert_eq!(changes.append, desired[1..].to_vec());
    }

    #[test]
    fn ensure_active_rules_is_idempotent() {
        let table = MemoryNatTable::new();
        let ports = PortMap::for_slot(Slot::Zero);

        let first = ensure_active_rules(&table, &ports).expect("first pass");
        let after_first = chain_rules(&table);
        let second = ensure_active_rules(&table, &ports).expect("second pass");

        assert_eq!(first.appended, 5);
        assert!(second.is_noop());
        assert_eq!(chain_rules(&table), after_first);
        assert_eq!(after_first, active_rules(&ports));
        for chain in ["PREROUTING", "OUTPUT"] {
            assert_eq!(
                table.list_rules(chain).expect("list jump chain"),
                vec![RuleSpec::jump(REWRITE_CHAIN)]
            );
        }
    }

    #[test]
    fn ensure_active_rules_resets_stale_chain() {
        let table = MemoryNatTable::new();
        table.insert_chain(REWRITE_CHAIN);
        for rule in transition_rules(&PortMap::for_slot(Slot::One), &PortMap::for_slot(Slot::Two)) {
            table.insert_rule(REWRITE_CHAIN, rule);
        }
        table.insert_rule(REWRITE_CHAIN, RuleSpec::parse("-p udp --dport 53 -j ACCEPT"));

        let ports = PortMap::for_slot(Slot::Zero);
        let outcome = ensure_active_rules(&table, &ports).expect("reset");

        assert_eq!(chain_rules(&table), active_rules(&ports));
        assert_eq!(outcome.deleted, 7);
    }

    #[test]
    fn transition_then_finalize_leaves_only_next_rules() {
        let table = MemoryNatTable::new();
        let active = PortMap::for_slot(Slot::Zero);
        let next = PortMap::for_slot(Slot::One);

        ensure_active_rules(&table, &active).expect("active");
        ensure_transition_rules(&table, &active, &next).expect("transition");
        let mut during = chain_rules(&table);
        during.sort();
        let mut expected = transition_rules(&active, &next);
        expected.sort();
        assert_eq!(during, expected);

        ensure_active_rules(&table, &next).expect("finalize");
        let after = chain_rules(&table);
        assert_eq!(after, active_rules(&next));
        assert!(after.iter().all(|rule| !rule.is_established_only()));
    }

    #[test]
    fn append_failure_aborts_reconciliation() {
        let table = MemoryNatTable::new();
        table.fail_appends_containing(":6444");

        let err = ensure_active_rules(&table, &PortMap::for_slot(Slot::One))
            .expect_err("append should fail");
        assert!(format!("{err:#}").contains("failed appending"));
    }
}
