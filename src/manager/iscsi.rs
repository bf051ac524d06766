//! iSCSI initiator setup of the local host

use super::SanManager;
use crate::error::{Error, Result};
use crate::topology::device::{IscsiHostConfig, IscsiIface};
use tracing::{debug, error, info};

/// Suffix iscsiadm may append to an interface name
const IPV4_IFACE_SUFFIX: &str = ".ipv4.0";

impl SanManager {
    /// iSCSI settings configured for this host.
    ///
    /// Returns `None` when the config has no `iscsi_initiator` section for
    /// the hostname. Interface names are matched against the host's iSCSI
    /// interfaces and rewritten when the host added an IPv4 suffix.
    pub async fn iscsi_host_conf(&self) -> Result<Option<IscsiHostConfig>> {
        let topology = self.topology()?;
        let hostname = self.host.hostname().await?;

        let Some(conf) = topology
            .iscsi_hosts()
            .values()
            .find(|h| h.hostname == hostname)
        else {
            debug!("No iSCSI settings for {}", hostname);
            return Ok(None);
        };

        let host_ifaces = self.host.iscsi_iface_names().await?;
        if host_ifaces.is_empty() {
            return Err(Error::Host(format!("{} does not have any iSCSI interface", hostname)));
        }

        let mut conf = conf.clone();
        for iface in conf.ifaces.values_mut() {
            let Some(name) = iface.name.as_deref() else {
                continue;
            };
            let suffixed = format!("{}{}", name, IPV4_IFACE_SUFFIX);
            let found = host_ifaces.iter().find(|h| *h == name || **h == suffixed).cloned();
            match found {
                Some(host_iface) => iface.name = Some(host_iface),
                None => {
                    return Err(Error::Configuration(format!(
                        "iSCSI interface {} is configured for {} but does not exist on the host",
                        name, hostname
                    )))
                }
            }
        }
        Ok(Some(conf))
    }

    /// Configure every iSCSI interface of this host, discover its portal
    /// and log in.
    ///
    /// A failing interface does not stop the others; the call fails if any
    /// interface failed.
    pub async fn setup_iscsi(&self) -> Result<()> {
        let Some(conf) = self.iscsi_host_conf().await? else {
            return Err(Error::Configuration("no iSCSI initiator settings for this host".into()));
        };
        if conf.ifaces.is_empty() {
            return Err(Error::Configuration(format!(
                "no iSCSI interface is configured for {}",
                conf.hostname
            )));
        }

        self.host.set_multipath_timeout().await?;

        let mut failed = Vec::new();
        for (num, iface) in &conf.ifaces {
            if let Err(e) = self.setup_iscsi_iface(iface).await {
                error!("Could not set up iSCSI interface {} of {}: {}", num, conf.hostname, e);
                failed.push(num.to_string());
            }
        }

        if !failed.is_empty() {
            return Err(Error::Host(format!(
                "iSCSI setup failed for interface(s) {}",
                failed.join(", ")
            )));
        }
        Ok(())
    }

    async fn setup_iscsi_iface(&self, iface: &IscsiIface) -> Result<()> {
        let name = iface.name.as_deref().unwrap_or("default");
        let (Some(portal), Some(iqn)) = (iface.target_ip.as_deref(), iface.iqn.as_deref()) else {
            return Err(Error::Configuration(format!(
                "interface {} requires target_ip and iface_iqn",
                name
            )));
        };

        if let Some(ip) = iface.ip.as_deref() {
            self.host
                .iface_set_ip(name, ip, iface.mask.as_deref(), iface.gateway.as_deref())
                .await?;
        }
        self.host.iface_set_iqn(name, iqn).await?;
        self.host.discover(portal, &[name.to_string()]).await?;
        self.host.node_login(None).await?;
        info!("{} logged in successfully to {}", name, portal);
        Ok(())
    }
}
