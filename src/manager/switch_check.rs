//! Switch configuration check
//!
//! Compares the WWPNs (and MACs, on Ethernet switches) each configured
//! switch reports per port with the port labels of its config section.

use super::SanManager;
use crate::domain::address::Address;
use crate::domain::capability::Capability;
use crate::drivers::DriverHandle;
use crate::error::{Error, Result};
use crate::topology::device::{DeviceKind, DeviceRecord};
use crate::topology::loader::SanConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

/// A switch port reporting a different address than configured
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortMismatch {
    pub switch: String,
    pub port: String,
    pub reported: Address,
    pub reported_alias: Option<String>,
    pub expected: Address,
    pub expected_alias: Option<String>,
}

/// A switch port with a logged in WWPN but no config entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnconfiguredPort {
    pub switch: String,
    pub port: String,
    pub address: Address,
    pub alias: Option<String>,
}

/// Outcome of [`SanManager::check_switch_config`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct SwitchCheckReport {
    pub checked: Vec<String>,
    /// Switches with `skip_check = 1` or without a usable driver
    pub skipped: Vec<String>,
    pub mismatches: Vec<PortMismatch>,
    pub unconfigured: Vec<UnconfiguredPort>,
}

impl SwitchCheckReport {
    /// No configured port disagrees with its switch
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl SanManager {
    /// Check `switch`, or every configured switch, against what the
    /// switches report.
    ///
    /// A switch section missing management fields, or managed over
    /// anything but ssh, fails the whole check.
    pub async fn check_switch_config(&self, switch: Option<&str>) -> Result<SwitchCheckReport> {
        let config = self.topology()?.config();
        let records: Vec<&DeviceRecord> = match switch {
            Some(name) => {
                let record = config
                    .device(name)
                    .filter(|r| r.kind == DeviceKind::Switch)
                    .ok_or_else(|| Error::InvalidArgument(format!("{} is not a configured switch", name)))?;
                vec![record]
            }
            None => config.devices_of(DeviceKind::Switch).collect(),
        };

        let mut report = SwitchCheckReport::default();
        for record in records {
            if record.skip_check() {
                info!("Skipping check of {}", record.name);
                report.skipped.push(record.name.clone());
                continue;
            }

            record.check_mandatory()?;
            let ctrl_type = record.require("ctrl_type")?;
            if !ctrl_type.contains("ssh") {
                return Err(Error::Configuration(format!(
                    "ctrl_type {} of [{}] is not supported",
                    ctrl_type, record.name
                )));
            }

            let params = config.driver_params(record, self.config.ctrl_timeout)?;
            let driver = match self.registry.create(&record.driver_key, params).await {
                Ok(DriverHandle::Switch(driver)) => driver,
                Ok(other) => {
                    warn!("[{}] has a {} driver, skipping", record.name, other.kind());
                    report.skipped.push(record.name.clone());
                    continue;
                }
                Err(e) => {
                    warn!("Could not check [{}]: {}", record.name, e);
                    report.skipped.push(record.name.clone());
                    continue;
                }
            };

            info!("Checking configuration for switch {} ({})", record.name, record.ctrl_ip().unwrap_or(""));
            let mismatches_before = report.mismatches.len();

            let configured = configured_ports(record);
            for (port, reported) in driver.wwpn_2_port_id().await? {
                match configured.get(port.as_str()) {
                    None => {
                        let alias = config.alias_of(reported.as_str()).map(str::to_string);
                        warn!(
                            "Port {} of {} is not configured, switch has {} ({})",
                            port,
                            record.name,
                            reported,
                            alias.as_deref().unwrap_or("no alias")
                        );
                        report.unconfigured.push(UnconfiguredPort {
                            switch: record.name.clone(),
                            port,
                            address: reported,
                            alias,
                        });
                    }
                    Some(expected) if **expected != reported => {
                        report.mismatches.push(mismatch(config, record, port, reported, expected))
                    }
                    Some(_) => {}
                }
            }

            if driver.capabilities().contains(&Capability::EthSwitch) {
                for (port, reported) in driver.mac_2_port_id().await? {
                    if let Some(expected) = configured.get(port.as_str()) {
                        if **expected != reported {
                            report.mismatches.push(mismatch(config, record, port, reported, expected));
                        }
                    }
                }
            }

            if report.mismatches.len() == mismatches_before {
                info!("No problem found on {}", record.name);
            }
            report.checked.push(record.name.clone());
        }
        Ok(report)
    }
}

/// Port label -> configured address
fn configured_ports(record: &DeviceRecord) -> BTreeMap<&str, &Address> {
    record
        .ports
        .iter()
        .map(|(addr, label)| (label.as_str(), addr))
        .collect()
}

fn mismatch(
    config: &SanConfig,
    record: &DeviceRecord,
    port: String,
    reported: Address,
    expected: &Address,
) -> PortMismatch {
    let entry = PortMismatch {
        switch: record.name.clone(),
        port,
        reported_alias: config.alias_of(reported.as_str()).map(str::to_string),
        reported,
        expected_alias: config.alias_of(expected.as_str()).map(str::to_string),
        expected: expected.clone(),
    };
    error!(
        "Switch {} port {} has {} ({}), config expects {} ({})",
        entry.switch,
        entry.port,
        entry.reported,
        entry.reported_alias.as_deref().unwrap_or("no alias"),
        entry.expected,
        entry.expected_alias.as_deref().unwrap_or("no alias")
    );
    entry
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::host::HostInventory;
    use crate::topology::san::AddressSets;
    use assert_matches::assert_matches;

    async fn check(text: &str, switch: Option<&str>) -> Result<SwitchCheckReport> {
        let (manager, _, _) = manager_with(text, AddressSets::default(), HostInventory::default()).await;
        manager.check_switch_config(switch).await
    }

    #[tokio::test]
    async fn test_matching_switch_is_clean() {
        let report = check(LAB, None).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.checked, vec!["sw1"]);
        assert!(report.unconfigured.is_empty());
    }

    #[tokio::test]
    async fn test_reports_mismatch_and_unconfigured_port() {
        let text = LAB
            .replace("sim_port_2 = st05_p2", "sim_port_2 = netapp_0a\nsim_port_5 = 10:00:00:00:c9:95:2f:e0")
            .replace("sim_port_9 = netapp_0a", "sim_port_9 = netapp_0a\nsim_port_eth7 = 08:00:27:05:37:72");
        let report = check(&text, Some("sw1")).await.unwrap();

        assert!(!report.is_clean());
        assert_eq!(report.mismatches.len(), 2);
        let wwpn = &report.mismatches[0];
        assert_eq!(wwpn.port, "2");
        assert_eq!(wwpn.reported_alias.as_deref(), Some("netapp_0a"));
        assert_eq!(wwpn.expected_alias.as_deref(), Some("st05_p2"));
        assert_eq!(report.mismatches[1].port, "eth7");

        assert_eq!(report.unconfigured.len(), 1);
        assert_eq!(report.unconfigured[0].port, "5");
        assert_eq!(report.unconfigured[0].alias, None);
    }

    #[tokio::test]
    async fn test_skip_check_and_bad_sections() {
        let skipped = LAB.replace("sim_port_1 = st05_p1", "sim_port_1 = st05_p1\nskip_check = 1");
        let report = check(&skipped, None).await.unwrap();
        assert_eq!(report.skipped, vec!["sw1"]);
        assert!(report.checked.is_empty());

        let telnet = LAB.replacen("ctrl_type = ssh", "ctrl_type = telnet", 1);
        assert_matches!(check(&telnet, None).await, Err(Error::Configuration(_)));

        assert_matches!(check(LAB, Some("patch1")).await, Err(Error::InvalidArgument(_)));
    }
}
