//! Multipath Selector
//!
//! Picks one representative multipath device per distinct storage path
//! signature, so tests run once per vendor/product, HBA set and array
//! rather than once per LUN.

use crate::domain::address::Address;
use crate::domain::ports::{HostFacts, MultipathDevice};
use crate::error::Result;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// What makes two multipath devices interchangeable for testing.
///
/// Target IQNs are left out since target-per-LUN arrays give every LUN its
/// own target.
#[derive(Debug, PartialEq, Eq)]
struct PathSignature<'a> {
    vendor: &'a str,
    product: &'a str,
    h_wwpns: BTreeSet<&'a Address>,
    t_wwpns: BTreeSet<&'a Address>,
    h_iqns: BTreeSet<&'a Address>,
}

impl<'a> PathSignature<'a> {
    fn of(mp: &'a MultipathDevice) -> Option<Self> {
        Some(Self {
            vendor: mp.vendor.as_deref()?,
            product: mp.product.as_deref()?,
            h_wwpns: mp.h_wwpns.iter().collect(),
            t_wwpns: mp.t_wwpns.iter().collect(),
            h_iqns: mp.h_iqns.iter().collect(),
        })
    }
}

/// Choose devices out of `free`.
///
/// With `mpath_name` only that device is returned, if it is free. Otherwise
/// the first SAN device of each path signature is kept, in input order.
pub fn choose_mpaths(free: &[MultipathDevice], mpath_name: Option<&str>) -> Vec<MultipathDevice> {
    if let Some(name) = mpath_name {
        return free.iter().filter(|mp| mp.name == name).take(1).cloned().collect();
    }

    let mut seen: Vec<PathSignature<'_>> = Vec::new();
    let mut chosen = Vec::new();
    for mp in free {
        let Some(signature) = PathSignature::of(mp) else {
            warn!("{} has no vendor or product info, skipping", mp.name);
            continue;
        };
        if !mp.is_san_device() {
            warn!("{} does not seem to be a SAN device, skipping", mp.name);
            continue;
        }
        if seen.contains(&signature) {
            debug!("{} duplicates the path of an already chosen device", mp.name);
            continue;
        }
        seen.push(signature);
        chosen.push(mp.clone());
    }

    if chosen.is_empty() {
        warn!("No multipath device chosen for testing");
    }
    chosen
}

/// Choose among the host's free multipath devices
pub async fn select_mpaths(
    host: &dyn HostFacts,
    mpath_name: Option<&str>,
    exclude_boot: bool,
    exclude_lvm: bool,
) -> Result<Vec<MultipathDevice>> {
    let free = host.free_mpaths(exclude_boot, exclude_lvm).await?;
    let chosen = choose_mpaths(&free, mpath_name);
    info!("Chose {} of {} free multipath devices", chosen.len(), free.len());
    Ok(chosen)
}
