//! Conversions from store records to placement requests.

use cellgrid_state::{ActualLrpKey, DesiredLrp, Resources, RootFs, StateResult, Task};

use crate::auction::{LrpStartRequest, TaskStartRequest};
use crate::scorer::{Capability, PlacementRequirements};

/// Capabilities implied by a rootfs, volume mounts and privilege.
pub fn requirements_for(
    rootfs: &str,
    resources: &Resources,
    volume_drivers: Vec<String>,
    privileged: bool,
) -> StateResult<PlacementRequirements> {
    let mut capabilities = vec![match RootFs::parse(rootfs)? {
        RootFs::Preloaded(stack) => Capability::Stack(stack),
        RootFs::Provider { scheme, .. } => Capability::Provider(scheme),
    }];
    if !volume_drivers.is_empty() {
        let mut drivers = volume_drivers;
        drivers.sort();
        drivers.dedup();
        capabilities.push(Capability::VolumeDrivers(drivers));
    }
    if privileged {
        capabilities.push(Capability::Privileged);
    }
    Ok(PlacementRequirements {
        memory_mb: resources.memory_mb,
        disk_mb: resources.disk_mb,
        capabilities,
    })
}

pub fn lrp_start_request(desired: &DesiredLrp, index: u32) -> StateResult<LrpStartRequest> {
    Ok(LrpStartRequest {
        key: ActualLrpKey::new(desired.process_guid.clone(), index),
        domain: desired.domain.clone(),
        requirements: requirements_for(
            &desired.rootfs,
            &desired.resources,
            desired.volume_drivers(),
            desired.privileged,
        )?,
    })
}

pub fn task_start_request(task: &Task) -> StateResult<TaskStartRequest> {
    Ok(TaskStartRequest {
        task_guid: task.task_guid.clone(),
        domain: task.domain.clone(),
        requirements: requirements_for(
            &task.rootfs,
            &task.resources,
            task.volume_drivers(),
            task.privileged,
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> Resources {
        Resources {
            memory_mb: 128,
            disk_mb: 256,
            max_pids: 0,
        }
    }

    #[test]
    fn preloaded_rootfs_needs_stack() {
        let req = requirements_for("preloaded:cflinuxfs", &resources(), vec![], false).unwrap();
        assert_eq!(req.capabilities, vec![Capability::Stack("cflinuxfs".into())]);
        assert_eq!(req.memory_mb, 128);
        assert_eq!(req.disk_mb, 256);
    }

    #[test]
    fn docker_rootfs_needs_provider() {
        let req = requirements_for("docker:///busybox", &resources(), vec![], true).unwrap();
        assert_eq!(
            req.capabilities,
            vec![Capability::Provider("docker".into()), Capability::Privileged]
        );
    }

    #[test]
    fn volume_drivers_are_deduplicated() {
        let req = requirements_for(
            "preloaded:cflinuxfs",
            &resources(),
            vec!["nfs".into(), "ceph".into(), "nfs".into()],
            false,
        )
        .unwrap();
        assert_eq!(
            req.capabilities[1],
            Capability::VolumeDrivers(vec!["ceph".into(), "nfs".into()])
        );
    }

    #[test]
    fn bad_rootfs_is_rejected() {
        assert!(requirements_for("busybox", &resources(), vec![], false).is_err());
    }
}
