//! `overseer` command-line entry point.

mod config;
mod simulate;

use clap::{Parser, Subcommand};
use config::OverseerConfig;
use overseer_orchestrator::{Scheduler, TaskPriority};
use serde::Serialize;
use simulate::{parse_task_arg, Simulation, SimulationPlan, SimulationReport};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "overseer", version, about = "Overseer multi-agent orchestration runtime")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "overseer.toml", global = true)]
    config: PathBuf,

    /// Print command output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Emit logs as JSON lines instead of plain text
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the config file, then summarize it
    CheckConfig,
    /// Run tasks and workflows against simulated agents and tools
    Simulate {
        /// Task to submit, as <task_type>:<description>. Repeatable.
        #[arg(short, long = "task")]
        tasks: Vec<String>,
        /// Workflow template to execute. Repeatable.
        #[arg(short, long = "workflow")]
        workflows: Vec<String>,
        /// Priority for every submitted task
        #[arg(long, value_enum, default_value_t = PriorityArg::Medium)]
        priority: PriorityArg,
        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
        /// Also run the configured schedules for this many seconds
        #[arg(long)]
        schedule_secs: Option<u64>,
    },
    /// List governed tools and which agents may call them
    Tools,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum PriorityArg {
    Low,
    Medium,
    High,
    Critical,
}

impl From<PriorityArg> for TaskPriority {
    fn from(p: PriorityArg) -> Self {
        match p {
            PriorityArg::Low => TaskPriority::Low,
            PriorityArg::Medium => TaskPriority::Medium,
            PriorityArg::High => TaskPriority::High,
            PriorityArg::Critical => TaskPriority::Critical,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = OverseerConfig::load(&cli.config).await?;
    info!(path = %cli.config.display(), "Config loaded");

    match cli.command {
        Commands::CheckConfig => check_config(&config, cli.json),
        Commands::Tools => list_tools(&config, cli.json),
        Commands::Simulate {
            tasks,
            workflows,
            priority,
            timeout_secs,
            schedule_secs,
        } => {
            let tasks = tasks
                .iter()
                .map(|t| parse_task_arg(t, priority.into()))
                .collect::<Result<Vec<_>, _>>()?;
            let plan = SimulationPlan {
                tasks,
                workflows,
                timeout: Duration::from_secs(timeout_secs),
                schedule_for: schedule_secs.map(Duration::from_secs),
            };
            let report = Simulation::build(config).await?.run(plan).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_report(&report);
            }
            if report.timed_out {
                anyhow::bail!("simulation did not settle before the timeout");
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct ConfigSummary {
    agents: Vec<String>,
    tools: Vec<String>,
    workflows: Vec<String>,
    schedules: Vec<ScheduleSummary>,
}

#[derive(Serialize)]
struct ScheduleSummary {
    name: String,
    enabled: bool,
    next_fire: Option<String>,
}

fn check_config(config: &OverseerConfig, json: bool) -> anyhow::Result<()> {
    let summary = ConfigSummary {
        agents: config
            .agents
            .iter()
            .map(|a| format!("{} ({})", a.agent_id, a.role))
            .collect(),
        tools: config.tools.iter().map(|t| t.name.clone()).collect(),
        workflows: config
            .workflows
            .iter()
            .map(|w| format!("{} ({} steps)", w.name, w.steps.len()))
            .collect(),
        schedules: config
            .schedules
            .iter()
            .map(|s| ScheduleSummary {
                name: s.name.clone(),
                enabled: s.enabled,
                next_fire: Scheduler::next_fire_time(&s.cron_expression)
                    .ok()
                    .map(|t| t.to_rfc3339()),
            })
            .collect(),
    };
    if json {
        return print_json(&summary);
    }

    println!("Config OK");
    for (label, items) in [
        ("Agents", &summary.agents),
        ("Tools", &summary.tools),
        ("Workflows", &summary.workflows),
    ] {
        println!("{label}: {}", items.len());
        for item in items {
            println!("  {item}");
        }
    }
    println!("Schedules: {}", summary.schedules.len());
    for s in &summary.schedules {
        let state = if s.enabled { "enabled" } else { "disabled" };
        println!(
            "  {} [{state}] next: {}",
            s.name,
            s.next_fire.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

#[derive(Serialize)]
struct ToolListing {
    name: String,
    description: String,
    risk_level: overseer_core::RiskLevel,
    rate_limit_per_minute: Option<u32>,
    requires_approval: bool,
    idempotent: bool,
    granted_to: Vec<String>,
}

fn list_tools(config: &OverseerConfig, json: bool) -> anyhow::Result<()> {
    let listing: Vec<ToolListing> = config
        .tools
        .iter()
        .map(|t| ToolListing {
            name: t.name.clone(),
            description: t.description.clone(),
            risk_level: t.risk_level,
            rate_limit_per_minute: t.rate_limit_per_minute,
            requires_approval: t.requires_approval,
            idempotent: t.idempotent,
            granted_to: config
                .agents
                .iter()
                .filter(|a| a.tools.contains(&t.name))
                .map(|a| a.agent_id.clone())
                .collect(),
        })
        .collect();
    if json {
        return print_json(&listing);
    }

    if listing.is_empty() {
        println!("No tools declared.");
        println!("Declare tools in overseer.toml under [[tools]]");
        return Ok(());
    }
    println!("Declared tools:");
    for tool in &listing {
        println!("  {} [{:?}] {}", tool.name, tool.risk_level, tool.description);
        if let Some(limit) = tool.rate_limit_per_minute {
            println!("    rate limit: {limit}/min per agent");
        }
        if tool.requires_approval {
            println!("    requires approval");
        }
        if tool.idempotent {
            println!("    identical concurrent calls share one run");
        }
        if !tool.granted_to.is_empty() {
            println!("    granted to: {}", tool.granted_to.join(", "));
        }
    }
    println!("\nTotal: {} tool(s)", listing.len());
    Ok(())
}

fn print_report(report: &SimulationReport) {
    for task in &report.tasks {
        println!(
            "task {} [{}] {}: {}",
            task.id,
            task.task_type,
            task.status,
            task.error.as_deref().unwrap_or("ok")
        );
    }
    for wf in &report.workflows {
        println!(
            "workflow {} ({}) {:?}: {} of {} steps",
            wf.id,
            wf.template,
            wf.status,
            wf.results.len(),
            wf.steps.len()
        );
    }
    for approval in &report.approvals {
        let verdict = if approval.approved { "approved" } else { "rejected" };
        println!(
            "approval {} {} for {} by {}",
            approval.approval_id, verdict, approval.tool_name, approval.agent_id
        );
    }

    let t = &report.status.tasks;
    println!(
        "\ntasks: {} completed, {} failed, {} cancelled, {} still queued",
        t.completed, t.failed, t.cancelled, t.queued
    );
    for agent in &report.status.agents {
        println!(
            "  {} ({}) {:?}: {} done, {} failed, avg {:.1}ms",
            agent.agent_id,
            agent.role,
            agent.status,
            agent.metrics.tasks_completed,
            agent.metrics.tasks_failed,
            agent.metrics.average_latency_ms()
        );
    }
    println!("tool calls: {}", report.usage.total.calls);
    for (tool, summary) in &report.usage.by_tool {
        println!("  {tool}: {}", summary.calls);
    }
}
