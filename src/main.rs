//! sanmgmt - SAN topology management CLI
//!
//! Loads the SAN topology file scoped to the addresses given on the command
//! line and runs one operation against the equipment serving them.
//!
//! ```text
//! sanmgmt --h-wwpn 10:00:00:00:c9:95:2f:de --t-wwpn 50:0a:09:85:99:4b:8d:c5 lun create 1G
//! sanmgmt --h-wwpn 10:00:00:00:c9:95:2f:de link down 10:00:00:00:c9:95:2f:de
//! sanmgmt check-switches --switch sw1
//! ```

use anyhow::{bail, Context};
use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use san_topology::domain::ports::HostFactsRef;
use san_topology::host::SysfsHostConfig;
use san_topology::manager::DEFAULT_CONF_PATH;
use san_topology::{
    DriverRegistry, FlapSpec, LinkAction, ManagerConfig, OscillateSpec, RcsnAction, SanManager,
    SysfsHost,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// sanmgmt - drive lab SAN switches, patch switches and storage arrays
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// SAN topology file
    #[arg(long, env = "SAN_TOP_CONF", default_value = DEFAULT_CONF_PATH)]
    conf: PathBuf,

    /// Host WWPN to scope the topology to (repeatable)
    #[arg(long = "h-wwpn")]
    h_wwpns: Vec<String>,

    /// Target WWPN to scope the topology to (repeatable)
    #[arg(long = "t-wwpn")]
    t_wwpns: Vec<String>,

    /// Host IQN to scope the topology to (repeatable)
    #[arg(long = "h-iqn")]
    h_iqns: Vec<String>,

    /// Target IQN to scope the topology to (repeatable)
    #[arg(long = "t-iqn")]
    t_iqns: Vec<String>,

    /// NIC MAC to scope the topology to (repeatable)
    #[arg(long = "mac")]
    macs: Vec<String>,

    /// Management channel timeout in seconds for devices without ctrl_tmo
    #[arg(long, env = "SAN_CTRL_TIMEOUT")]
    ctrl_timeout_secs: Option<u64>,

    /// Sysfs root used for host facts
    #[arg(long, env = "SYSFS_PATH", default_value = "/sys")]
    sysfs_path: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the topology and print it as JSON
    Show,
    /// Compare what switches report with the topology file
    CheckSwitches {
        /// Only check this switch
        #[arg(long)]
        switch: Option<String>,
    },
    /// LUN lifecycle on the array in scope
    Lun {
        #[command(subcommand)]
        action: LunCommand,
    },
    /// Logical switch port control
    Link {
        #[command(subcommand)]
        action: LinkCommand,
    },
    /// Physical layer switch port control
    Phy {
        #[command(subcommand)]
        action: PhyCommand,
    },
    /// Registered state change notifications
    Rcsn {
        #[command(subcommand)]
        action: RcsnCommand,
    },
    /// Storage array controller lifecycle
    Ctrl {
        #[command(subcommand)]
        action: CtrlCommand,
    },
    /// Bring up every port this host needs
    PortsReady,
    /// Configure the iSCSI initiator of this host and log in
    SetupIscsi,
    /// Representative free multipath devices of this host
    Mpaths {
        /// Only this multipath device
        name: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum LunCommand {
    /// Create a LUN (size like 500M, 1G)
    Create {
        size: String,
        #[arg(long)]
        name: Option<String>,
        /// Thin provisioned
        #[arg(long)]
        thin: bool,
        /// Map the new LUN to the host, removing it if that fails
        #[arg(long)]
        map: bool,
        #[arg(long)]
        rescan: bool,
    },
    Map {
        name: String,
        #[command(flatten)]
        path: MapPath,
        #[arg(long)]
        rescan: bool,
    },
    Unmap {
        name: String,
        #[command(flatten)]
        path: MapPath,
    },
    Remove {
        name: String,
    },
    Info {
        name: String,
    },
    List,
}

#[derive(ClapArgs, Debug)]
struct MapPath {
    /// Only map through this target address
    #[arg(long)]
    target: Option<String>,
    /// Only map through this initiator address
    #[arg(long)]
    initiator: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct Oscillation {
    #[arg(long, default_value = "100")]
    count: u32,
    #[arg(long, default_value = "1")]
    min_uptime_secs: u64,
    #[arg(long, default_value = "1")]
    max_uptime_secs: u64,
    #[arg(long, default_value = "1")]
    min_downtime_secs: u64,
    #[arg(long, default_value = "1")]
    max_downtime_secs: u64,
}

impl From<&Oscillation> for OscillateSpec {
    fn from(o: &Oscillation) -> Self {
        OscillateSpec {
            min_uptime: Duration::from_secs(o.min_uptime_secs),
            max_uptime: Duration::from_secs(o.max_uptime_secs),
            min_downtime: Duration::from_secs(o.min_downtime_secs),
            max_downtime: Duration::from_secs(o.max_downtime_secs),
            count: o.count,
        }
    }
}

#[derive(Subcommand, Debug)]
enum LinkCommand {
    Up {
        addr: String,
        /// Do not wait for the new port state
        #[arg(long)]
        no_check: bool,
    },
    Down {
        addr: String,
        #[arg(long)]
        no_check: bool,
    },
    Oscillate {
        addr: String,
        #[command(flatten)]
        oscillation: Oscillation,
    },
    State {
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum PhyCommand {
    Up {
        addr: String,
        #[arg(long)]
        no_check: bool,
    },
    Down {
        addr: String,
        #[arg(long)]
        no_check: bool,
    },
    Flap {
        addr: String,
        #[arg(long)]
        uptime_us: u64,
        #[arg(long)]
        downtime_us: u64,
        #[arg(long, default_value = "100")]
        count: u32,
    },
    Oscillate {
        addr: String,
        #[command(flatten)]
        oscillation: Oscillation,
    },
    State {
        addr: String,
    },
}

#[derive(Subcommand, Debug)]
enum RcsnCommand {
    Enable { addr: String },
    Disable { addr: String },
}

#[derive(Subcommand, Debug)]
enum CtrlCommand {
    Reboot {
        t_addr: String,
    },
    Check {
        t_addr: String,
    },
    Wait {
        t_addr: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Target WWPNs of every controller
    Ports,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting {} {}", san_topology::NAME, san_topology::VERSION);
    info!("  SAN config: {}", args.conf.display());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = ManagerConfig {
        conf_path: args.conf.clone(),
        ctrl_timeout: args.ctrl_timeout_secs.map(Duration::from_secs),
        ..ManagerConfig::default()
    };
    let host: HostFactsRef = Arc::new(SysfsHost::new(SysfsHostConfig {
        sysfs_path: args.sysfs_path.clone(),
        ..SysfsHostConfig::default()
    }));

    let mut manager = SanManager::new(config, DriverRegistry::with_builtin(), host);

    if let Command::Mpaths { name } = &args.command {
        return print_json(&manager.choose_mpaths(name.as_deref()).await?);
    }

    manager
        .set_addresses_from_str(&args.h_wwpns, &args.t_wwpns, &args.h_iqns, &args.t_iqns, &args.macs)
        .context("invalid address on the command line")?;

    let report = manager.load_conf().await;
    if !report.loaded {
        bail!("could not load SAN config {}", args.conf.display());
    }
    if !report.is_clean() {
        warn!("{} devices could not be loaded", report.device_errors.len());
    }

    match args.command {
        Command::Show => print_json(&manager.topology()?.view()),
        Command::CheckSwitches { switch } => {
            let report = manager.check_switch_config(switch.as_deref()).await?;
            print_json(&report)?;
            if !report.is_clean() {
                bail!("{} switch ports do not match the config", report.mismatches.len());
            }
            Ok(())
        }
        Command::Lun { action } => run_lun(&manager, action).await,
        Command::Link { action } => run_link(&manager, action).await,
        Command::Phy { action } => run_phy(&manager, action).await,
        Command::Rcsn { action } => {
            match action {
                RcsnCommand::Enable { addr } => manager.rcsn_trigger(RcsnAction::Enable, &addr).await?,
                RcsnCommand::Disable { addr } => manager.rcsn_trigger(RcsnAction::Disable, &addr).await?,
            }
            Ok(())
        }
        Command::Ctrl { action } => run_ctrl(&manager, action).await,
        Command::PortsReady => Ok(manager.check_ports_ready().await?),
        Command::SetupIscsi => Ok(manager.setup_iscsi().await?),
        Command::Mpaths { .. } => Ok(()),
    }
}

async fn run_lun(manager: &SanManager, action: LunCommand) -> anyhow::Result<()> {
    match action {
        LunCommand::Create {
            size,
            name,
            thin,
            map,
            rescan,
        } => {
            let lun = if map {
                manager.lun_create_and_map(&size, name.as_deref(), thin, rescan).await?
            } else {
                manager.lun_create(&size, name.as_deref(), thin).await?
            };
            println!("{}", lun);
        }
        LunCommand::Map { name, path, rescan } => {
            manager
                .lun_map(&name, path.target.as_deref(), path.initiator.as_deref(), rescan)
                .await?
        }
        LunCommand::Unmap { name, path } => {
            manager
                .lun_unmap(&name, path.target.as_deref(), path.initiator.as_deref())
                .await?
        }
        LunCommand::Remove { name } => manager.lun_remove(&name).await?,
        LunCommand::Info { name } => match manager.lun_info(&name).await? {
            Some(info) => print_json(&info)?,
            None => bail!("LUN {} does not exist", name),
        },
        LunCommand::List => print_json(&manager.lun_query().await?)?,
    }
    Ok(())
}

async fn run_link(manager: &SanManager, action: LinkCommand) -> anyhow::Result<()> {
    match action {
        LinkCommand::Up { addr, no_check } => manager.link_trigger(LinkAction::Up, &addr, !no_check).await?,
        LinkCommand::Down { addr, no_check } => {
            manager.link_trigger(LinkAction::Down, &addr, !no_check).await?
        }
        LinkCommand::Oscillate { addr, oscillation } => {
            manager.link_oscillate(&addr, &OscillateSpec::from(&oscillation)).await?
        }
        LinkCommand::State { addr } => println!("{}", manager.port_state(&addr).await?),
    }
    Ok(())
}

async fn run_phy(manager: &SanManager, action: PhyCommand) -> anyhow::Result<()> {
    match action {
        PhyCommand::Up { addr, no_check } => {
            manager.phy_link_trigger(LinkAction::Up, &addr, !no_check).await?
        }
        PhyCommand::Down { addr, no_check } => {
            manager.phy_link_trigger(LinkAction::Down, &addr, !no_check).await?
        }
        PhyCommand::Flap {
            addr,
            uptime_us,
            downtime_us,
            count,
        } => {
            let spec = FlapSpec {
                uptime_us,
                downtime_us,
                count,
            };
            manager.phy_link_flap(&addr, &spec).await?
        }
        PhyCommand::Oscillate { addr, oscillation } => {
            manager.phy_link_oscillate(&addr, &OscillateSpec::from(&oscillation)).await?
        }
        PhyCommand::State { addr } => match manager.phy_port_state(&addr).await? {
            Some(mode) => println!("{}", mode),
            None => println!("disconnected"),
        },
    }
    Ok(())
}

async fn run_ctrl(manager: &SanManager, action: CtrlCommand) -> anyhow::Result<()> {
    match action {
        CtrlCommand::Reboot { t_addr } => manager.sa_ctrler_reboot(&t_addr).await?,
        CtrlCommand::Check { t_addr } => println!("{}", manager.sa_ctrler_check(&t_addr).await?),
        CtrlCommand::Wait {
            t_addr,
            timeout_secs,
            interval_secs,
        } => {
            manager
                .sa_ctrler_wait(
                    &t_addr,
                    timeout_secs.map(Duration::from_secs),
                    interval_secs.map(Duration::from_secs),
                )
                .await?
        }
        CtrlCommand::Ports => print_json(&manager.sa_t_wwpn_2_ctrler().await?)?,
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Logging
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // Logs go to stderr so JSON output on stdout stays parseable
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
