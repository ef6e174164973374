use crate::cmd::open_project;
use crate::output::{fmt_opt_time, fmt_time, print_json, print_table};
use hookq_core::{StatusService, SystemClock};
use std::path::Path;
use std::sync::Arc;

fn service(root: &Path) -> anyhow::Result<StatusService> {
    let project = open_project(root)?;
    Ok(StatusService::new(project.store, Arc::new(SystemClock)))
}

pub fn counts(root: &Path, group: Option<&str>, json: bool) -> anyhow::Result<()> {
    let counts = service(root)?.counts(group)?;
    if json {
        return print_json(&counts);
    }
    let mut rows: Vec<Vec<String>> = counts
        .iter()
        .map(|(status, n)| vec![status.to_string(), n.to_string()])
        .collect();
    rows.push(vec!["total".to_string(), counts.total().to_string()]);
    print_table(&["STATUS", "COUNT"], rows);
    Ok(())
}

pub fn summary(root: &Path, json: bool) -> anyhow::Result<()> {
    let summary = service(root)?.summary()?;
    if json {
        return print_json(&summary);
    }
    let counts: Vec<String> = summary
        .counts
        .iter()
        .map(|(status, n)| format!("{status}={n}"))
        .collect();
    println!("counts:              {}", counts.join(" "));
    println!("overdue:             {}", summary.overdue);
    match &summary.next_due {
        Some(next) => println!(
            "next due:            {} ({}) at {}",
            next.action_id,
            next.hook,
            fmt_time(next.due_at)
        ),
        None => println!("next due:            -"),
    }
    println!("oldest in progress:  {}", fmt_opt_time(summary.oldest_in_progress));
    Ok(())
}
