use console::Style;

use crate::schedule::RunSummary;
use crate::state::RunState;
use crate::target::Target;

pub fn print_error(msg: &str) {
    let style = Style::new().red().bold();
    eprintln!("{} {}", style.apply_to("✗"), msg);
}

pub fn print_success(msg: &str) {
    let style = Style::new().green().bold();
    println!("{} {}", style.apply_to("✓"), msg);
}

pub fn print_run_summary(summary: &RunSummary, blacklist: &[(Target, String)]) {
    let state = &summary.state;
    let score_pct = state.mutation_score * 100.0;
    let line_pct = state.line_coverage * 100.0;
    let branch_pct = state.branch_coverage * 100.0;

    let marker = if state.mutants_survived == 0 {
        Style::new().green().bold().apply_to("✓").to_string()
    } else {
        Style::new().yellow().bold().apply_to("!").to_string()
    };
    println!(
        "{} {} batches: {} mutants, {} killed, {} survived ({:.1}% score)",
        marker,
        state.iteration,
        state.mutants_total,
        state.mutants_killed,
        state.mutants_survived,
        score_pct,
    );
    println!(
        "  coverage: {:.1}% lines, {:.1}% branches · {} generation calls",
        line_pct, branch_pct, state.generation_calls,
    );

    let dim = Style::new().dim();
    if state.merge_conflicts > 0 {
        println!(
            "  {} {} merge conflicts resolved first-writer-wins",
            dim.apply_to("·"),
            state.merge_conflicts
        );
    }
    if !blacklist.is_empty() {
        println!("  {} {} targets blacklisted:", dim.apply_to("·"), blacklist.len());
        for (target, reason) in blacklist {
            println!("    {} {}: {}", dim.apply_to("-"), target, reason);
        }
    }
    println!("  stopped: {}", summary.stop);
}

pub fn print_status(state: &RunState) {
    println!(
        "Last run: batch {}, {} mutants, {} killed, {} survived ({:.1}% score)",
        state.iteration,
        state.mutants_total,
        state.mutants_killed,
        state.mutants_survived,
        state.mutation_score * 100.0,
    );
    println!(
        "Coverage: {:.1}% lines, {:.1}% branches",
        state.line_coverage * 100.0,
        state.branch_coverage * 100.0,
    );
    if !state.action_log.is_empty() {
        println!();
        let dim = Style::new().dim();
        for action in state.action_log.iter().rev().take(10) {
            println!("  {} {}", dim.apply_to("·"), action);
        }
    }
}
