//! Cohort coordinator administration tool. Every invocation restarts the
//! coordinator over its durable log, replays it, and runs one command.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use cohort::{
    logger_init, pf_error, pf_info, pf_warn, CohortError, FileLog, ManagerHooks,
    MembershipManager, ReplicationId, ServerId, ServiceMask, ME,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Path to the coordinator's log file.
    #[arg(short, long, default_value = "/tmp/cohort.log")]
    log_path: PathBuf,

    /// Manager configuration in TOML format.
    #[arg(short, long)]
    config: Option<String>,

    /// Skip fsync after every log write.
    #[arg(long)]
    no_sync: bool,

    /// Rewrite the log file down to its live entries before exiting.
    #[arg(long)]
    compact: bool,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,

    #[command(subcommand)]
    command: AdminCommand,
}

/// What to do after replay.
#[derive(Subcommand, Debug, PartialEq, Eq)]
enum AdminCommand {
    /// Print the server list.
    List {
        /// Only servers running any of these services, e.g., "backup".
        #[arg(short, long, default_value = "master,backup,membership,ping")]
        services: String,
    },

    /// Enlist a server.
    Enlist {
        /// Services the server runs, e.g., "master,backup".
        #[arg(short, long)]
        services: String,

        /// Service locator of the server.
        #[arg(short = 'a', long)]
        locator: String,

        /// Server ID this one replaces, as "index.generation".
        #[arg(short, long)]
        replaces: Option<String>,

        /// Disk read throughput in MB/s.
        #[arg(long, default_value_t = 0)]
        read_speed: u32,

        /// Disk write throughput in MB/s.
        #[arg(long, default_value_t = 0)]
        write_speed: u32,
    },

    /// Take a server out of the cluster unconditionally.
    Down { server: String },

    /// Report a suspected failure, which gets verified first.
    Hint { server: String },

    /// Raise a server's min open segment ID.
    Watermark { server: String, segment: u64 },

    /// Form replication groups from ungrouped backups, or one group with
    /// the given ID and members.
    Group {
        #[arg(short, long)]
        id: Option<ReplicationId>,

        /// Comma-separated member server IDs.
        #[arg(short, long)]
        members: Option<String>,
    },

    /// Dissolve a replication group.
    Dissolve { id: ReplicationId },

    /// Push the server list to a membership server.
    Push { server: String },
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(CohortError)` on any error.
    fn sanitize(&self) -> Result<(), CohortError> {
        if self.threads < 2 {
            return Err(CohortError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }
        if self.log_path.as_os_str().is_empty() {
            return Err(CohortError::msg("empty log path"));
        }
        match &self.command {
            AdminCommand::Group { id, members } => {
                if id.is_some() != members.is_some() {
                    Err(CohortError::msg(
                        "group needs both --id and --members, or neither",
                    ))
                } else if *id == Some(0) {
                    Err(CohortError::msg("group ID 0 is reserved"))
                } else {
                    Ok(())
                }
            }
            AdminCommand::Dissolve { id: 0 } => {
                Err(CohortError::msg("group ID 0 is reserved"))
            }
            _ => Ok(()),
        }
    }
}

/// Parses a comma-separated list of server IDs.
fn parse_members(s: &str) -> Result<Vec<ServerId>, CohortError> {
    s.split(',')
        .filter(|m| !m.trim().is_empty())
        .map(|m| m.parse())
        .collect()
}

/// Runs one command against a replayed manager.
async fn run_command(
    manager: &MembershipManager,
    command: &AdminCommand,
) -> Result<(), CohortError> {
    match command {
        AdminCommand::List { services } => {
            let list = manager.get_server_list(&services.parse()?).await;
            println!("version {}, {} servers", list.version, list.len());
            for e in &list.servers {
                println!(
                    "{:>6}  {:<8} {:<28} group {:<4} min_open {:<6} '{}'",
                    e.server_id.to_string(),
                    format!("{:?}", e.status),
                    e.services.to_string(),
                    e.replication_id,
                    e.min_open_segment_id,
                    e.service_locator
                );
            }
        }

        AdminCommand::Enlist {
            services,
            locator,
            replaces,
            read_speed,
            write_speed,
        } => {
            let replaces = match replaces {
                Some(id) => id.parse()?,
                None => ServerId::INVALID,
            };
            let services: ServiceMask = services.parse()?;
            let server_id = manager
                .enlist(replaces, services, *read_speed, *write_speed, locator)
                .await?;
            println!("enlisted {}", server_id);
        }

        AdminCommand::Down { server } => {
            manager.server_down(server.parse()?).await?;
            println!("{} is down", server);
        }

        AdminCommand::Hint { server } => {
            if manager.hint_server_down(server.parse()?).await? {
                println!("{} is down", server);
            } else {
                println!("{} is alive", server);
            }
        }

        AdminCommand::Watermark { server, segment } => {
            manager
                .set_min_open_segment_id(server.parse()?, *segment)
                .await?;
        }

        AdminCommand::Group { id, members } => match (id, members) {
            (Some(id), Some(members)) => {
                let members = parse_members(members)?;
                if manager.assign_replication_group(*id, &members).await? {
                    println!("formed group {}", id);
                } else {
                    return Err(CohortError::msg(format!(
                        "group {} rejected",
                        id
                    )));
                }
            }
            _ => {
                let created = manager.create_replication_group().await?;
                println!("formed groups {:?}", created);
            }
        },

        AdminCommand::Dissolve { id } => {
            manager.remove_replication_group(*id).await?;
        }

        AdminCommand::Push { server } => {
            manager.send_server_list(server.parse()?).await?;
        }
    }
    Ok(())
}

/// Actual main function of the admin tool.
fn admin_main() -> Result<(), CohortError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-admin")
            .build()?;

        // enter tokio runtime, restart the coordinator over its log, and run
        // the requested command
        runtime.block_on(async move {
            let intent_log = Arc::new(
                FileLog::new_and_setup(&args.log_path, !args.no_sync).await?,
            );
            let (hooks, mut rx_recover) = ManagerHooks::with_defaults();
            let manager = MembershipManager::new(
                intent_log.clone(),
                hooks,
                args.config.as_deref(),
            )?;
            manager.replay().await?;

            run_command(&manager, &args.command).await?;

            while let Ok(server_id) = rx_recover.try_recv() {
                pf_warn!("data of {} needs recovery", server_id);
            }
            if args.compact {
                let now_size = intent_log.compact().await?;
                pf_info!("log compacted to {} bytes", now_size);
            }

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), CohortError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the admin tool.
fn main() -> ExitCode {
    logger_init();
    let _ = ME.set("c".into());

    if let Err(ref e) = admin_main() {
        pf_error!("admin_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
