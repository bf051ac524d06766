//! Link and port control
//!
//! Logical switch operations are gated on the capabilities of the switch
//! owning the address. Physical layer operations are gated per address,
//! and a port must report `Active` before it is reconnected.

use super::SanManager;
use crate::domain::address::Address;
use crate::domain::capability::Capability;
use crate::domain::ports::{
    ConnectMode, FlapSpec, LinkAction, OscillateSpec, PortState, RcsnAction, PHY_PORT_ACTIVE,
};
use crate::error::{Error, Result};
use crate::topology::san::{AttachedDevice, AttachedPhySwitch};
use tracing::{debug, error, info, warn};

impl SanManager {
    // =========================================================================
    // Logical Switch
    // =========================================================================

    /// Bring the switch port of `addr` up or down
    pub async fn link_trigger(&self, action: LinkAction, addr: &str, check_state: bool) -> Result<()> {
        let cap = match action {
            LinkAction::Up => Capability::LinkUp,
            LinkAction::Down => Capability::LinkDown,
        };
        let owner = self.switch_for(addr, cap)?;
        info!("Link {} on {} port {} ({})", action, owner.name(), owner.port_id, owner.address);
        owner
            .device
            .driver
            .link_trigger(action, owner.port_id, check_state)
            .await
    }

    pub async fn link_up(&self, addr: &str, check_state: bool) -> Result<()> {
        self.link_trigger(LinkAction::Up, addr, check_state).await
    }

    pub async fn link_down(&self, addr: &str, check_state: bool) -> Result<()> {
        self.link_trigger(LinkAction::Down, addr, check_state).await
    }

    /// Enable or suppress state change notifications on the port of `addr`
    pub async fn rcsn_trigger(&self, action: RcsnAction, addr: &str) -> Result<()> {
        let cap = match action {
            RcsnAction::Enable => Capability::RcsnEnable,
            RcsnAction::Disable => Capability::RcsnDisable,
        };
        let owner = self.switch_for(addr, cap)?;
        info!("RCSN {} on {} port {}", action, owner.name(), owner.port_id);
        owner.device.driver.rcsn_trigger(action, owner.port_id).await
    }

    pub async fn rcsn_enable(&self, addr: &str) -> Result<()> {
        self.rcsn_trigger(RcsnAction::Enable, addr).await
    }

    pub async fn rcsn_disable(&self, addr: &str) -> Result<()> {
        self.rcsn_trigger(RcsnAction::Disable, addr).await
    }

    /// Take the switch port of `addr` down and up again `spec.count` times
    pub async fn link_oscillate(&self, addr: &str, spec: &OscillateSpec) -> Result<()> {
        spec.validate(self.config.max_repeat_count)?;
        let owner = self.switch_for(addr, Capability::LinkOscillate)?;
        info!(
            "Oscillating {} port {} {} times",
            owner.name(),
            owner.port_id,
            spec.count
        );
        owner.device.driver.port_oscillate(owner.port_id, spec).await
    }

    pub async fn port_state(&self, addr: &str) -> Result<PortState> {
        let owner = self.switch_owner(addr)?;
        owner.device.driver.port_state(owner.port_id).await
    }

    // =========================================================================
    // Physical Layer Switch
    // =========================================================================

    /// Connect or disconnect the physical port of `addr`.
    ///
    /// UP reconnects the port to its configured destination, simplex when
    /// a simplex cross-connect is configured for it.
    pub async fn phy_link_trigger(&self, action: LinkAction, addr: &str, check_state: bool) -> Result<()> {
        let cap = match action {
            LinkAction::Up => Capability::PhyPortConnect,
            LinkAction::Down => Capability::PhyPortDisconnect,
        };
        let owner = self.physwitch_for(addr, cap)?;
        let driver = &owner.device.driver;
        ensure_active(owner.device, owner.port_id).await?;

        match action {
            LinkAction::Down => {
                info!("Disconnecting {} port {}", owner.name(), owner.port_id);
                driver.port_disconnect(owner.port_id, check_state).await
            }
            LinkAction::Up => {
                let (dst, mode) = destination(owner.device, owner.port_id)?;
                info!("Connecting {} port {} to {} ({})", owner.name(), owner.port_id, dst, mode);
                driver.port_connect(owner.port_id, dst, mode, check_state).await
            }
        }
    }

    /// Current connection of the physical port of `addr`
    pub async fn phy_port_state(&self, addr: &str) -> Result<Option<ConnectMode>> {
        let owner = self.physwitch_owner(addr)?;
        owner.device.driver.connect_mode_of(owner.port_id).await
    }

    /// Disconnect and reconnect the physical port of `addr` `spec.count` times
    pub async fn phy_link_oscillate(&self, addr: &str, spec: &OscillateSpec) -> Result<()> {
        spec.validate(self.config.max_repeat_count)?;
        let owner = self.physwitch_for(addr, Capability::PhyPortOscillate)?;
        let (dst, mode) = destination(owner.device, owner.port_id)?;
        info!(
            "Oscillating {} port {} ({} {}) {} times",
            owner.name(),
            owner.port_id,
            mode,
            dst,
            spec.count
        );
        owner
            .device
            .driver
            .port_oscillate(owner.port_id, dst, mode, spec)
            .await
    }

    /// Driver-timed fast flapping of the physical port of `addr`
    pub async fn phy_link_flap(&self, addr: &str, spec: &FlapSpec) -> Result<()> {
        spec.validate(self.config.max_repeat_count)?;
        let owner = self.physwitch_for(addr, Capability::PhyPortFlap)?;
        info!("Flapping {} port {} {} times", owner.name(), owner.port_id, spec.count);
        owner.device.driver.port_flap(owner.port_id, spec).await
    }

    // =========================================================================
    // Port Readiness
    // =========================================================================

    /// Make sure every port this host's tests need is up.
    ///
    /// Host WWPNs and NIC MACs are brought up (physical layer first) when
    /// down. Target WWPNs are only checked, since a down target is usually
    /// somebody else's test. RCSN is enabled wherever the switch supports it.
    pub async fn check_ports_ready(&self) -> Result<()> {
        info!("Checking if all ports that we need are UP");
        let topology = self.topology()?;
        let resolver = topology.resolver();

        for h_wwpn in self.host.fc_host_wwpns().await? {
            if resolver.physwitch_of(&h_wwpn).is_some() {
                debug!("Physical switch checking port {}", h_wwpn);
                if self.phy_port_state(h_wwpn.as_str()).await?.is_none() {
                    if let Err(e) = self.phy_link_trigger(LinkAction::Up, h_wwpn.as_str(), true).await {
                        warn!("Could not connect physical port of {}: {}", h_wwpn, e);
                    }
                    if self.phy_port_state(h_wwpn.as_str()).await?.is_none() {
                        return Err(not_ready("physwitch", &h_wwpn, "could not be connected"));
                    }
                }
            }
            self.ensure_switch_port_up(&h_wwpn, true).await?;
        }

        for t_wwpn in self.host.fc_target_wwpns().await? {
            if resolver.physwitch_of(&t_wwpn).is_some()
                && self.phy_port_state(t_wwpn.as_str()).await?.is_none()
            {
                return Err(not_ready(
                    "physwitch",
                    &t_wwpn,
                    "target is disconnected, maybe another test brought it down on purpose",
                ));
            }
            self.ensure_switch_port_up(&t_wwpn, false).await?;
        }

        for nic in self.host.nics().await? {
            if nic.name == "lo" {
                continue;
            }
            let Some(mac) = nic.mac else {
                warn!("Could not get MAC of interface {}", nic.name);
                continue;
            };
            self.ensure_switch_port_up(&mac, true).await?;
        }

        info!("All ports that we need are UP");
        Ok(())
    }

    /// Check the switch port of `addr` is up, bringing it up when allowed,
    /// then enable RCSN if the switch supports it
    async fn ensure_switch_port_up(&self, addr: &Address, bring_up: bool) -> Result<()> {
        let Some(owner) = self.topology()?.resolver().switch_of(addr) else {
            debug!("{} is not managed by any switch", addr);
            return Ok(());
        };

        debug!("Checking {} port {} ({})", owner.name(), owner.port_id, addr);
        if self.port_state(addr.as_str()).await? != PortState::Up {
            if !bring_up {
                return Err(not_ready(
                    owner.name(),
                    addr,
                    "target is down, maybe another test brought it down on purpose",
                ));
            }
            if let Err(e) = self.link_up(addr.as_str(), true).await {
                warn!("Could not bring {} up: {}", addr, e);
            }
            if self.port_state(addr.as_str()).await? != PortState::Up {
                return Err(not_ready(owner.name(), addr, "could not be brought up"));
            }
        }

        if owner.device.capabilities().contains(&Capability::RcsnEnable) {
            self.rcsn_enable(addr.as_str()).await.map_err(|e| {
                error!("Could not enable RCSN on {}: {}", addr, e);
                e
            })?;
        }
        Ok(())
    }
}

async fn ensure_active(device: &AttachedPhySwitch, port_id: &str) -> Result<()> {
    let status = device.driver.port_status(port_id).await?;
    if status != PHY_PORT_ACTIVE {
        return Err(Error::PortNotActive {
            port: format!("{}:{}", device.name(), port_id),
            status,
        });
    }
    Ok(())
}

fn destination<'a>(device: &'a AttachedPhySwitch, port_id: &str) -> Result<(&'a str, ConnectMode)> {
    device
        .record
        .physical_topology
        .destination_of(port_id)
        .ok_or_else(|| {
            Error::Configuration(format!(
                "[{}] has no simplex_con_{} or duplex_con_{}",
                device.name(),
                port_id,
                port_id
            ))
        })
}

fn not_ready(device: &str, addr: &Address, reason: &str) -> Error {
    error!("Port {} on {} is not ready: {}", addr, device, reason);
    Error::driver(device, "check_ports_ready", format!("port {} {}", addr, reason))
}
