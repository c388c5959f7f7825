use std::process::Command;

use anyhow::{anyhow, Context, Result};

use super::{NatTable, RuleSpec};

const NAT_TABLE: &str = "nat";
/// `iptables -C` exits with 1 when the rule is absent; higher codes are errors.
const RULE_ABSENT_EXIT_CODE: i32 = 1;
const MAX_ERROR_CHARS: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute '{}' with args {:?}", program, args))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub struct IptablesTable<R = SystemCommandRunner> {
    runner: R,
    binary: String,
    wait_for_lock: bool,
}

impl IptablesTable<SystemCommandRunner> {
    pub fn new(binary: impl Into<String>, wait_for_lock: bool) -> Self {
        Self::with_runner(SystemCommandRunner, binary, wait_for_lock)
    }
}

impl<R: CommandRunner> IptablesTable<R> {
    pub fn with_runner(runner: R, binary: impl Into<String>, wait_for_lock: bool) -> Self {
        Self {
            runner,
            binary: binary.into(),
            wait_for_lock,
        }
    }

    fn command_args(&self, operation: &[&str], rule: Option<&RuleSpec>) -> Vec<String> {
        let mut args = vec!["-t".to_string(), NAT_TABLE.to_string()];
        if self.wait_for_lock {
            args.push("-w".to_string());
        }
        args.extend(operation.iter().map(|arg| arg.to_string()));
        if let Some(rule) = rule {
            args.extend(rule.args().iter().cloned());
        }
        args
    }

    fn run(&self, args: &[String]) -> Result<CommandOutput> {
        self.runner.run(&self.binary, args)
    }

    fn run_checked(&self, args: &[String]) -> Result<String> {
        let output = self.run(args)?;
        if !output.success() {
            return Err(command_error(&self.binary, args, &output));
        }
        Ok(output.stdout)
    }
}

impl<R: CommandRunner> NatTable for IptablesTable<R> {
    fn chain_exists(&self, chain: &str) -> Result<bool> {
        let listing = self.run_checked(&self.command_args(&["-S"], None))?;
        let declaration = format!("-N {chain}");
        Ok(listing.lines().any(|line| line.trim() == declaration))
    }

    fn new_chain(&self, chain: &str) -> Result<()> {
        self.run_checked(&self.command_args(&["-N", chain], None))
            .map(|_| ())
    }

    fn rule_exists(&self, chain: &str, rule: &RuleSpec) -> Result<bool> {
        let args = self.command_args(&["-C", chain], Some(rule));
        let output = self.run(&args)?;
        match output.code {
            Some(0) => Ok(true),
            Some(RULE_ABSENT_EXIT_CODE) => Ok(false),
            _ => Err(command_error(&self.binary, &args, &output)),
        }
    }

    fn append(&self, chain: &str, rule: &RuleSpec) -> Result<()> {
        self.run_checked(&self.command_args(&["-A", chain], Some(rule)))
            .map(|_| ())
    }

    fn list_rules(&self, chain: &str) -> Result<Vec<RuleSpec>> {
        let listing = self.run_checked(&self.command_args(&["-S", chain], None))?;
        Ok(parse_chain_listing(chain, &listing))
    }

    fn delete(&self, chain: &str, rule: &RuleSpec) -> Result<()> {
        self.run_checked(&self.command_args(&["-D", chain], Some(rule)))
            .map(|_| ())
    }
}

pub fn parse_chain_listing(chain: &str, listing: &str) -> Vec<RuleSpec> {
    let prefix = format!("-A {chain} ");
    listing
        .lines()
        .filter_map(|line| line.trim().strip_prefix(prefix.as_str()))
        .map(RuleSpec::parse)
        .collect()
}

fn command_error(binary: &str, args: &[String], output: &CommandOutput) -> anyhow::Error {
    let code = output.code.unwrap_or(-1);
    let stderr = summarize(&output.stderr);
    if stderr.is_empty() {
        anyhow!("{} {} exited with code {}", binary, args.join(" "), code)
    } else {
        anyhow!(
            "{} {} exited with code {}: {}",
            binary,
            args.join(" "),
            code,
            stderr
        )
    }
}

fn summarize(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.chars().count() <= MAX_ERROR_CHARS {
        return trimmed.to_string();
    }
    let prefix = trimmed.chars().take(MAX_ERROR_CHARS).collect::<String>();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use anyhow::Result;

    use super::{parse_chain_listing, CommandOutput, CommandRunner, IptablesTable};
    use crate::nat::{NatTable, RuleSpec};

    #[derive(Default)]
    struct FakeRunnerState {
        responses: VecDeque<CommandOutput>,
        calls: Vec<Vec<String>>,
    }

    #[derive(Clone, Default)]
    struct FakeRunner {
        state: Arc<Mutex<FakeRunnerState>>,
    }

    impl FakeRunner {
        fn push(&self, code: i32, stdout: &str, stderr: &str) {
            let mut state = self.state.lock().expect("lock fake runner");
            state.responses.push_back(CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.state.lock().expect("lock fake runner").calls.clone()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
            let mut state = self.state.lock().expect("lock fake runner");
            let mut call = vec![program.to_string()];
            call.extend(args.iter().cloned());
            state.calls.push(call);
            Ok(state.responses.pop_front().unwrap_or(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }))
        }
    }

    fn joined(calls: &[Vec<String>]) -> Vec<String> {
        calls.iter().map(|call| call.join(" ")).collect()
    }

    #[test]
    fn listing_keeps_only_chain_rules() {
        let listing = "-N GRACEFUL_MONITOR_REWRITE\n\
-A GRACEFUL_MONITOR_REWRITE -p tcp -m addrtype --dst-type LOCAL -m tcp --dport 6443 -j DNAT --to-destination :6444\n\
-A OTHER -j RETURN\n";

        let rules = parse_chain_listing("GRACEFUL_MONITOR_REWRITE", listing);

        assert_eq!(rules, vec![RuleSpec::dnat(6443, 6444)]);
    }

    #[test]
    fn commands_target_nat_table_and_wait_for_lock() {
        let runner = FakeRunner::default();
        let table = IptablesTable::with_runner(runner.clone(), "iptables", true);

        table
            .append("GRACEFUL_MONITOR_REWRITE", &RuleSpec::dnat(6080, 6081))
            .expect("append");
        table
            .delete("OUTPUT", &RuleSpec::jump("GRACEFUL_MONITOR_REWRITE"))
            .expect("delete");

        assert_eq!(
            joined(&runner.calls()),
            vec![
                "iptables -t nat -w -A GRACEFUL_MONITOR_REWRITE -p tcp -m addrtype --dst-type LOCAL -m tcp --dport 6080 -j DNAT --to-destination :6081".to_string(),
                "iptables -t nat -w -D OUTPUT -j GRACEFUL_MONITOR_REWRITE".to_string(),
            ]
        );
    }

    #[test]
    fn check_exit_code_one_means_absent() {
        let runner = FakeRunner::default();
        runner.push(1, "", "iptables: Bad rule (does a matching rule exist in that chain?).");
        runner.push(0, "", "");
        runner.push(2, "", "iptables v1.8.7: unknown option \"--bogus\"");
        let table = IptablesTable::with_runner(runner.clone(), "iptables", false);
        let jump = RuleSpec::jump("GRACEFUL_MONITOR_REWRITE");

        assert!(!table.rule_exists("PREROUTING", &jump).expect("absent"));
        assert!(table.rule_exists("PREROUTING", &jump).expect("present"));
        let err = table
            .rule_exists("PREROUTING", &jump)
            .expect_err("usage error should fail");
        assert!(err.to_string().contains("exited with code 2"));
        assert_eq!(
            runner.calls()[0],
            vec!["iptables", "-t", "nat", "-C", "PREROUTING", "-j", "GRACEFUL_MONITOR_REWRITE"]
        );
    }

    #[test]
    fn chain_exists_reads_table_listing() {
        let runner = FakeRunner::default();
        runner.push(0, "-P PREROUTING ACCEPT\n-N KUBE-SERVICES\n", "");
        runner.push(0, "-P PREROUTING ACCEPT\n-N GRACEFUL_MONITOR_REWRITE\n", "");
        let table = IptablesTable::with_runner(runner, "iptables", true);

        assert!(!table
            .chain_exists("GRACEFUL_MONITOR_REWRITE")
            .expect("first listing"));
        assert!(table
            .chain_exists("GRACEFUL_MONITOR_REWRITE")
            .expect("second listing"));
    }

    #[test]
    fn failed_append_reports_stderr() {
        let runner = FakeRunner::default();
        runner.push(4, "", "iptables: Resource temporarily unavailable.");
        let table = IptablesTable::with_runner(runner, "/usr/sbin/iptables", true);

        let err = table
            .append("GRACEFUL_MONITOR_REWRITE", &RuleSpec::dnat(6443, 6443))
            .expect_err("append should fail");
        let message = err.to_string();
        assert!(message.starts_with("/usr/sbin/iptables -t nat -w -A GRACEFUL_MONITOR_REWRITE"));
        assert!(message.ends_with("Resource temporarily unavailable."));
    }
}
