use crate::cmd::{open_project, parse_id};
use crate::output::{fmt_opt_time, fmt_time, print_json, print_table};
use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use hookq_core::{
    Action, ActionFilter, ActionQuery, ActionStatus, CancelOutcome, NewAction, Schedule,
    SortColumn, SortOrder,
};
use serde_json::Value;
use std::path::Path;

// ---------------------------------------------------------------------------
// Argument types
// ---------------------------------------------------------------------------

#[derive(Args)]
pub struct EnqueueArgs {
    /// Hook name (must be configured under `hooks:` to run)
    pub hook: String,

    /// Argument passed to the hook; parsed as JSON, bare words become strings.
    /// Repeatable.
    #[arg(long = "arg", value_name = "JSON")]
    pub args: Vec<String>,

    /// First due time (RFC 3339)
    #[arg(long, conflicts_with = "in_secs")]
    pub at: Option<String>,

    /// First due time as seconds from now
    #[arg(long = "in", value_name = "SECS")]
    pub in_secs: Option<u64>,

    /// Repeat every SECS seconds, aligned to the first due time
    #[arg(long, value_name = "SECS", conflicts_with = "cron")]
    pub every: Option<u64>,

    /// Repeat on a 5-field cron expression (UTC)
    #[arg(long, value_name = "EXPR", conflicts_with_all = ["at", "in_secs"])]
    pub cron: Option<String>,

    #[arg(long)]
    pub group: Option<String>,

    /// Higher runs first among actions due at the same time
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,

    /// Override retry.max_attempts for this action
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Reuse a live action with the same hook, args and group
    #[arg(long)]
    pub unique: bool,
}

#[derive(Args)]
pub struct ListArgs {
    /// Filter by status (repeatable): pending, in-progress, complete, failed, canceled
    #[arg(long = "status", value_name = "STATUS")]
    pub statuses: Vec<String>,

    #[arg(long)]
    pub group: Option<String>,

    #[arg(long)]
    pub hook: Option<String>,

    /// Case-insensitive match over hook, group, args and last error
    #[arg(long)]
    pub search: Option<String>,

    /// Only actions due at or after this time (RFC 3339)
    #[arg(long)]
    pub due_after: Option<String>,

    /// Only actions due at or before this time (RFC 3339)
    #[arg(long)]
    pub due_before: Option<String>,

    /// Sort column: id, hook, group, status, next-due, created-at, priority
    #[arg(long, default_value = "next-due")]
    pub sort: String,

    #[arg(long)]
    pub desc: bool,

    #[arg(long)]
    pub limit: Option<usize>,

    #[arg(long, default_value_t = 0)]
    pub offset: usize,
}

// ---------------------------------------------------------------------------
// enqueue
// ---------------------------------------------------------------------------

pub fn enqueue(root: &Path, args: EnqueueArgs, json: bool) -> anyhow::Result<()> {
    let project = open_project(root)?;
    let now = Utc::now();
    let new_action = build_new_action(args, now)?;
    let action = project
        .store
        .enqueue(new_action, now)
        .context("failed to enqueue action")?;

    if json {
        return print_json(&action);
    }
    println!(
        "Enqueued {} ({}, {}) due {}",
        action.id,
        action.hook,
        action.schedule.kind(),
        fmt_time(action.next_due_at)
    );
    Ok(())
}

fn build_new_action(args: EnqueueArgs, now: DateTime<Utc>) -> anyhow::Result<NewAction> {
    let start = match (&args.at, args.in_secs) {
        (Some(at), _) => parse_time(at)?,
        (None, Some(secs)) => i64::try_from(secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delta| now.checked_add_signed(delta))
            .with_context(|| format!("--in {secs} is too large"))?,
        (None, None) => now,
    };
    let schedule = match (args.every, args.cron) {
        (_, Some(expr)) => Schedule::cron(expr),
        (Some(every), None) => Schedule::interval(start, every),
        (None, None) => Schedule::single(start),
    };

    let mut new_action = NewAction::new(args.hook, schedule)
        .with_args(args.args.iter().map(|a| parse_arg(a)).collect())
        .with_priority(args.priority);
    if let Some(group) = args.group {
        new_action = new_action.in_group(group);
    }
    if let Some(max) = args.max_attempts {
        new_action = new_action.with_max_attempts(max);
    }
    if args.unique {
        new_action = new_action.unique();
    }
    Ok(new_action)
}

fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid RFC 3339 time '{raw}'"))
}

// ---------------------------------------------------------------------------
// cancel
// ---------------------------------------------------------------------------

pub fn cancel(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let project = open_project(root)?;
    let outcome = project.store.cancel(id, Utc::now())?;
    let action = project.store.get(id)?;

    if json {
        return print_json(&serde_json::json!({
            "id": id,
            "outcome": outcome,
            "status": action.status,
        }));
    }
    match outcome {
        CancelOutcome::Canceled => println!("Canceled {id}"),
        CancelOutcome::Requested => {
            println!("Cancel requested for {id}; it will not run again after the current execution")
        }
        CancelOutcome::Unchanged => println!("{id} is already {}", action.status),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// get
// ---------------------------------------------------------------------------

pub fn get(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let id = parse_id(id)?;
    let project = open_project(root)?;
    let action = project.store.get(id)?;

    if json {
        return print_json(&action);
    }

    println!("id:         {}", action.id);
    println!("hook:       {}", action.hook);
    println!("status:     {}", action.status);
    println!("schedule:   {}", describe_schedule(&action.schedule));
    if let Some(group) = &action.group {
        println!("group:      {group}");
    }
    if !action.args.is_empty() {
        println!("args:       {}", serde_json::to_string(&action.args)?);
    }
    println!("priority:   {}", action.priority);
    println!("next due:   {}", fmt_time(action.next_due_at));
    println!("runs:       {}", action.runs);
    match action.max_attempts {
        Some(max) => println!("attempts:   {} (max {max})", action.attempts),
        None => println!("attempts:   {}", action.attempts),
    }
    println!("started:    {}", fmt_opt_time(action.started_at));
    println!("completed:  {}", fmt_opt_time(action.completed_at));
    if action.cancel_requested && action.status == ActionStatus::InProgress {
        println!("cancel:     requested");
    }
    if let Some(err) = &action.last_error {
        println!(
            "last error: [{}] {} at {}",
            err.kind.as_str(),
            err.message,
            fmt_time(err.at)
        );
    }

    if !action.events.is_empty() {
        println!();
        let rows = action
            .events
            .iter()
            .map(|e| vec![fmt_time(e.at), e.message.clone()])
            .collect();
        print_table(&["AT", "EVENT"], rows);
    }
    Ok(())
}

fn describe_schedule(schedule: &Schedule) -> String {
    match schedule {
        Schedule::Single { at } => format!("once at {}", fmt_time(*at)),
        Schedule::Interval { start, every_secs } => {
            format!("every {every_secs}s from {}", fmt_time(*start))
        }
        Schedule::Cron { expression } => format!("cron '{expression}' (UTC)"),
    }
}

// ---------------------------------------------------------------------------
// list
// ---------------------------------------------------------------------------

pub fn list(root: &Path, args: ListArgs, json: bool) -> anyhow::Result<()> {
    let query = build_query(args)?;
    let project = open_project(root)?;
    let actions = project.store.query(&query)?;

    if json {
        return print_json(&actions);
    }
    if actions.is_empty() {
        println!("No actions.");
        return Ok(());
    }
    print_table(
        &["ID", "HOOK", "GROUP", "STATUS", "SCHEDULE", "NEXT DUE", "ATTEMPTS"],
        actions.iter().map(row).collect(),
    );
    Ok(())
}

fn build_query(args: ListArgs) -> anyhow::Result<ActionQuery> {
    let statuses = args
        .statuses
        .iter()
        .map(|s| s.parse::<ActionStatus>())
        .collect::<Result<Vec<_>, _>>()?;
    let filter = ActionFilter {
        statuses,
        group: args.group,
        hook: args.hook,
        due_after: args.due_after.as_deref().map(parse_time).transpose()?,
        due_before: args.due_before.as_deref().map(parse_time).transpose()?,
        search: args.search,
    };
    let order = if args.desc {
        SortOrder::Desc
    } else {
        SortOrder::Asc
    };
    let mut query = ActionQuery::new(filter).sorted_by(args.sort.parse::<SortColumn>()?, order);
    query.limit = args.limit;
    query.offset = args.offset;
    query.validate()?;
    Ok(query)
}

fn row(a: &Action) -> Vec<String> {
    vec![
        a.id.to_string(),
        a.hook.clone(),
        a.group.clone().unwrap_or_else(|| "-".to_string()),
        a.status.to_string(),
        a.schedule.kind().to_string(),
        fmt_time(a.next_due_at),
        a.attempts.to_string(),
    ]
}
