// ABOUTME: Terminal prompts for duplicate resolution and import confirmation
// ABOUTME: Implements DecisionSource with inquire, falling back to abort without a terminal

use crate::config::DuplicatePolicy;
use crate::report;
use crate::sync::{Decision, DecisionSource, DuplicateReport, FixedDecision};
use anyhow::Result;
use inquire::{Confirm, Select};
use std::io::IsTerminal;

const LIST: &str = "List duplicate rows";
const REMOVE: &str = "Remove duplicates, keep the lowest-key row of each group";
const ABORT: &str = "Abort this table";

/// Asks on the terminal what to do with each non-unique table.
pub struct PromptDecisions;

impl DecisionSource for PromptDecisions {
    fn decide(&mut self, report: &DuplicateReport) -> Decision {
        println!();
        println!(
            "{}: {} duplicate group(s) on ({}), {} row(s) would be removed",
            report.table,
            report.groups.len(),
            report.match_on.join(", "),
            report.removable_rows()
        );

        let answer = Select::new("How should the duplicates be handled?", vec![LIST, REMOVE, ABORT])
            .with_help_message("↑↓ to move, Enter to select, Esc to abort")
            .prompt();

        match answer {
            Ok(LIST) => Decision::List,
            Ok(REMOVE) => Decision::AutoRemove,
            Ok(_) => Decision::Abort,
            Err(inquire::InquireError::OperationCanceled) | Err(inquire::InquireError::OperationInterrupted) => {
                Decision::Abort
            }
            Err(e) => {
                tracing::warn!("Prompt failed ({}), aborting table", e);
                Decision::Abort
            }
        }
    }

    fn list(&mut self, report: &DuplicateReport) {
        report::print_duplicates(report);
    }
}

/// True when both stdin and stdout are attached to a terminal.
pub fn is_interactive() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

/// Pick the decision source for a duplicate policy.
///
/// `prompt` asks on the terminal when one is available and aborts otherwise;
/// `auto-remove` always removes; every other policy never reaches the
/// resolver and gets an aborting source.
pub fn decision_source(policy: DuplicatePolicy, no_interactive: bool) -> Box<dyn DecisionSource> {
    match policy {
        DuplicatePolicy::Prompt if !no_interactive && is_interactive() => Box::new(PromptDecisions),
        DuplicatePolicy::Prompt => {
            tracing::warn!("on_duplicates = prompt but no terminal is available, duplicates will abort");
            Box::new(FixedDecision(Decision::Abort))
        }
        DuplicatePolicy::AutoRemove => Box::new(FixedDecision(Decision::AutoRemove)),
        _ => Box::new(FixedDecision(Decision::Abort)),
    }
}

/// Ask before mutating the target.
pub fn confirm_execute(target: &str, tables: usize) -> Result<bool> {
    if !is_interactive() {
        anyhow::bail!("Refusing to apply changes without confirmation; pass --yes to run non-interactively");
    }
    let answer = Confirm::new(&format!("Apply changes to {} table(s) on {}?", tables, target))
        .with_default(false)
        .prompt();
    match answer {
        Ok(confirmed) => Ok(confirmed),
        Err(inquire::InquireError::OperationCanceled) | Err(inquire::InquireError::OperationInterrupted) => {
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
