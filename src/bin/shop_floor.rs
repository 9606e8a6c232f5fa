// bin/shop_floor.rs - Job-shop demo organization

use anyhow::{Context as _, Result};
use clap::Parser;
use rand::Rng;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use fipa_contract_net::observability::{init_metrics, init_tracing, MetricsConfig, TracingConfig, TracingFormat};
use fipa_contract_net::prelude::*;
use fipa_contract_net::{OrganizationConfig, SubscriberView};

/// Job-shop floor running on contract-net agents
#[derive(Parser, Debug)]
#[command(name = "shop-floor")]
#[command(version)]
#[command(about = "Job pool, job release and machine agents negotiating work over FIPA Contract-Net", long_about = None)]
struct Args {
    /// Port of the job pool agent; the other agents count up from here
    #[arg(default_value_t = 20000)]
    base_port: u16,

    /// Number of machine agents
    #[arg(short, long, default_value_t = 5)]
    machines: u16,

    /// Host every agent binds to
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Config file path (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "compact")]
    log_format: TracingFormat,

    /// Enable metrics server
    #[arg(long)]
    metrics: bool,

    /// Metrics listen address
    #[arg(long, default_value = "0.0.0.0:9090")]
    metrics_addr: SocketAddr,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_for: Option<u64>,
}

const CFP_PERIOD: Duration = Duration::from_secs(8);
const RELEASE_PERIOD: Duration = Duration::from_secs(5);
const MACHINE_SUBSCRIBE_DELAY: Duration = Duration::from_secs(4);
const JOB_SUBSCRIBE_DELAY: Duration = Duration::from_millis(500);
const JOB_CANCEL_AFTER: Duration = Duration::from_millis(5_000);
const JOB_LIFETIME: Duration = Duration::from_secs(6);

fn job_pool(address: Address, config: &EngineConfig) -> AgentSpec {
    let publisher = Publisher::new().with_name("job-pool-registry").on_subscribe(|who, topic, ctx| {
        info!(agent = %ctx.agent_name(), subscriber = %who.name, topic, "Subscribe message accepted");
    });
    let view = publisher.subscribers();
    let initiator = ContractNetInitiator::new(publisher.subscribers(), config.initiator.clone())
        .with_name("job-bid-request")
        .on_outcome(|outcome| match outcome {
            RoundOutcome::Decided(decision) => match &decision.winner {
                Some(best) => info!(conversation = %decision.conversation_id, bidder = %best.bidder.name, power = best.value, "The best proposal was {} VA", best.value),
                None => info!(conversation = %decision.conversation_id, "No valid proposals"),
            },
            RoundOutcome::Closed { conversation_id, contractor, expired } => {
                info!(conversation = %conversation_id, contractor = ?contractor.as_ref().map(|c| &c.name), expired, "Round closed")
            }
        });

    AgentSpec::new(address)
        .with_behaviour(publisher)
        .with_behaviour(initiator)
        .with_behaviour(timed_job_proposals(view))
}

/// Every period, call for proposals on a job
fn timed_job_proposals(jobs: SubscriberView) -> TimedBehaviour {
    TimedBehaviour::new("timed-job-proposals", CFP_PERIOD, move |_, ctx| {
        let waiting: Vec<_> = jobs
            .get_partial_subscribers("job")
            .into_iter()
            .map(|job| job.name)
            .collect();
        info!(agent = %ctx.agent_name(), jobs = ?waiting, "Jobs to process");
        ctx.notify(AclMessage::new(Performative::Cfp, ProtocolType::ContractNet).with_content("60.0"));
    })
}

/// Every period, release a job agent on the next free port
fn job_release(address: Address, pool: Address, org: OrganizationHandle) -> AgentSpec {
    let host = address.host.clone();
    let first_port = address.port.saturating_add(10_000 - 1);
    AgentSpec::new(address).with_behaviour(TimedBehaviour::new(
        "timed-job-release",
        RELEASE_PERIOD,
        move |n, ctx| {
            let offset = u16::try_from((n - 1) * 100).unwrap_or(u16::MAX);
            let port = first_port.saturating_add(offset);
            let job_type = rand::rng().random_range(1..=6);
            let job = Address::new(format!("job_agent_{port}"), host.clone(), port);
            info!(agent = %ctx.agent_name(), job = %job, job_type, "Releasing job");
            org.spawn_detached(job_agent(job, pool.clone(), job_type));
        },
    ))
}

fn job_agent(address: Address, pool: Address, job_type: u32) -> AgentSpec {
    AgentSpec::new(address)
        .call_later(JOB_SUBSCRIBE_DELAY, move |ctx| {
            ctx.add_behaviour(
                Subscriber::new(pool, "job")
                    .with_name("job-subscription")
                    .cancel_after(JOB_CANCEL_AFTER - JOB_SUBSCRIBE_DELAY)
                    .on_agree(|_, ctx| info!(agent = %ctx.agent_name(), "Subscription agreed")),
            );
        })
        .call_later(JOB_LIFETIME, move |ctx| {
            info!(agent = %ctx.agent_name(), job_type, "Agent deregistering, type of job was {job_type}");
            ctx.deactivate();
        })
}

fn machine(address: Address, pool: Address, config: &EngineConfig) -> AgentSpec {
    let participant = ContractNetParticipant::new(config.participant.clone())
        .with_name("job-bid-response")
        .on_award(|msg, ctx| info!(agent = %ctx.agent_name(), conversation = %msg.conversation_id, "ACCEPT_PROPOSE message received"));

    AgentSpec::new(address)
        .with_behaviour(participant)
        .call_later(MACHINE_SUBSCRIBE_DELAY, move |ctx| {
            info!(agent = %ctx.agent_name(), "Hello World!");
            ctx.add_behaviour(
                Subscriber::new(pool, "machine")
                    .with_name("machine-subscription")
                    .on_inform(|msg, ctx| info!(agent = %ctx.agent_name(), content = %msg.content, "Notice received")),
            );
        })
}

#[actix_rt::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(TracingConfig::for_level(&args.log_level, args.log_format))
        .context("failed to install tracing subscriber")?;

    let _metrics_handle = if args.metrics {
        let handle = init_metrics(MetricsConfig {
            listen_addr: args.metrics_addr,
            ..Default::default()
        })?;
        info!(addr = %args.metrics_addr, "Metrics recorder initialized");
        Some(handle)
    } else {
        None
    };

    let mut config = EngineConfig::load(args.config.as_deref())?;
    if config.organization == OrganizationConfig::default() {
        config.organization.name = String::from("shop-floor");
    }

    let port = |offset: u16| {
        args.base_port
            .checked_add(offset)
            .with_context(|| format!("port {} + {offset} out of range", args.base_port))
    };
    let pool = Address::new(format!("job_pool_agent_{}", args.base_port), args.host.clone(), args.base_port);
    let release = Address::new(format!("job_release_agent_{}", port(1)?), args.host.clone(), port(1)?);

    let org = OrganizationHandle::start(&config);
    let mut specs = vec![
        job_pool(pool.clone(), &config),
        job_release(release, pool.clone(), org.clone()),
    ];
    for n in 0..args.machines {
        let machine_port = port(2 + n)?;
        let address = Address::new(format!("machine_agent_{}", n + 1), args.host.clone(), machine_port);
        specs.push(machine(address, pool.clone(), &config));
    }

    let agents = org.start_loop(specs).await?;
    info!(agents = agents.len(), pool = %pool, "Shop floor running");

    match args.run_for {
        Some(secs) => actix_rt::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    info!("Shutting down");
    org.shutdown().await?;
    Ok(())
}
