//! Console summary of a reporting session.

use crate::run::RunState;
use crate::session::{FlushError, FlushReport, SessionStats};

/// Prints the counters of a session.
fn print_stats(stats: &SessionStats) {
    println!("  Reported:    {}", console::style(stats.forwarded).green());
    if stats.reruns > 0 {
        println!("  Reruns:      {}", console::style(stats.reruns).yellow());
    }
    println!("  Parents:     {}", stats.parents_created);
    println!("  Attachments: {}", stats.attachments_uploaded);

    if stats.deferred > 0 {
        println!("  Deferred:    {}", console::style(stats.deferred).yellow());
    }
    if stats.failed_deliveries > 0 {
        println!(
            "  Refused:     {}",
            console::style(stats.failed_deliveries).red()
        );
    }
    if stats.dropped > 0 {
        println!("  Dropped:     {}", console::style(stats.dropped).red().bold());
    }
}

/// Prints a summary of a successful flush.
pub fn print_summary(report: &FlushReport) {
    println!();
    println!("Run {}:", report.run.id);
    print_stats(&report.stats);
    println!("  Duration:    {:.1}s", report.elapsed.as_secs_f64());

    println!();
    let state = match report.run.state() {
        RunState::Completed => console::style("Run completed.").green().bold(),
        RunState::Aborted => console::style("Run marked aborted.").yellow().bold(),
        RunState::InProgress => console::style("Run left open.").dim(),
    };
    println!("{}", state);

    if report.stats.dropped > 0 || report.stats.failed_deliveries > 0 {
        println!(
            "{}",
            console::style("Some results were not accepted by the tracker.")
                .red()
                .bold()
        );
    }
}

/// Prints what is known about a failed flush.
pub fn print_failure(error: &FlushError) {
    println!();
    println!("{}", console::style("Reporting failed:").red().bold());
    println!("  {}", error);
    if let Some(stats) = error.stats() {
        print_stats(stats);
    }
}
